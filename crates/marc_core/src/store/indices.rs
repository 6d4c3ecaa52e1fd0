use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{Entity, EntityKind, EntityRef};
use crate::error::AppError;
use crate::fsio::{read_json_opt, write_json_atomic};
use crate::normalize::names::normalize_name;

type ParentIndex = BTreeMap<String, BTreeSet<String>>;

/// Secondary indices derived from primary records. Empty keys are pruned so that an
/// incrementally maintained instance compares equal to one rebuilt from scratch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Indices {
    pub meetings_by_workgroup: ParentIndex,
    pub documents_by_meeting: ParentIndex,
    pub agenda_items_by_meeting: ParentIndex,
    pub decisions_by_agenda_item: ParentIndex,
    pub actions_by_agenda_item: ParentIndex,
    pub person_refs: BTreeMap<String, BTreeSet<EntityRef>>,
    pub people_by_name: ParentIndex,
}

pub const INDEX_NAMES: [&str; 7] = [
    "meetings_by_workgroup",
    "documents_by_meeting",
    "agenda_items_by_meeting",
    "decisions_by_agenda_item",
    "actions_by_agenda_item",
    "person_refs",
    "people_by_name",
];

fn add(ix: &mut ParentIndex, key: &str, val: &str) {
    ix.entry(key.to_string()).or_default().insert(val.to_string());
}

fn del(ix: &mut ParentIndex, key: &str, val: &str) {
    if let Some(set) = ix.get_mut(key) {
        set.remove(val);
        if set.is_empty() {
            ix.remove(key);
        }
    }
}

impl Indices {
    pub fn build<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Self {
        let mut ix = Self::default();
        for e in entities {
            ix.insert(e);
        }
        ix
    }

    fn owner_index_mut(&mut self, child: EntityKind) -> Option<&mut ParentIndex> {
        match child {
            EntityKind::Meeting => Some(&mut self.meetings_by_workgroup),
            EntityKind::Document => Some(&mut self.documents_by_meeting),
            EntityKind::AgendaItem => Some(&mut self.agenda_items_by_meeting),
            EntityKind::DecisionItem => Some(&mut self.decisions_by_agenda_item),
            EntityKind::ActionItem => Some(&mut self.actions_by_agenda_item),
            EntityKind::Workgroup | EntityKind::Person => None,
        }
    }

    pub fn owner_index(&self, child: EntityKind) -> Option<&ParentIndex> {
        match child {
            EntityKind::Meeting => Some(&self.meetings_by_workgroup),
            EntityKind::Document => Some(&self.documents_by_meeting),
            EntityKind::AgendaItem => Some(&self.agenda_items_by_meeting),
            EntityKind::DecisionItem => Some(&self.decisions_by_agenda_item),
            EntityKind::ActionItem => Some(&self.actions_by_agenda_item),
            EntityKind::Workgroup | EntityKind::Person => None,
        }
    }

    /// Parent id an entity is filed under in its owner index.
    fn parent_key(e: &Entity) -> Option<&str> {
        match e {
            Entity::Meeting(m) => Some(m.workgroup_id.as_str()),
            Entity::Document(d) => Some(d.meeting_id.as_str()),
            Entity::AgendaItem(a) => Some(a.meeting_id.as_str()),
            Entity::DecisionItem(d) => Some(d.agenda_item_id.as_str()),
            Entity::ActionItem(a) => Some(a.agenda_item_id.as_str()),
            Entity::Workgroup(_) | Entity::Person(_) => None,
        }
    }

    pub fn insert(&mut self, e: &Entity) {
        let kind = e.kind();
        let id = e.id().to_string();
        if let Some(parent) = Self::parent_key(e) {
            let parent = parent.to_string();
            if let Some(ix) = self.owner_index_mut(kind) {
                add(ix, &parent, &id);
            }
        }
        for r in e.references() {
            if r.kind == EntityKind::Person {
                self.person_refs
                    .entry(r.id.clone())
                    .or_default()
                    .insert(e.entity_ref());
            }
        }
        if let Entity::Person(p) = e {
            for name in std::iter::once(&p.display_name).chain(p.aliases.iter()) {
                let n = normalize_name(name);
                if !n.is_empty() {
                    add(&mut self.people_by_name, &n, &p.id);
                }
            }
        }
    }

    pub fn remove(&mut self, e: &Entity) {
        let kind = e.kind();
        let id = e.id().to_string();
        if let Some(parent) = Self::parent_key(e) {
            let parent = parent.to_string();
            if let Some(ix) = self.owner_index_mut(kind) {
                del(ix, &parent, &id);
            }
        }
        let me = e.entity_ref();
        for r in e.references() {
            if r.kind == EntityKind::Person {
                if let Some(set) = self.person_refs.get_mut(&r.id) {
                    set.remove(&me);
                    if set.is_empty() {
                        self.person_refs.remove(&r.id);
                    }
                }
            }
        }
        if let Entity::Person(p) = e {
            for name in std::iter::once(&p.display_name).chain(p.aliases.iter()) {
                let n = normalize_name(name);
                del(&mut self.people_by_name, &n, &p.id);
            }
        }
    }

    /// Direct children of `parent` in the cascade DAG.
    pub fn children(&self, parent: &EntityRef) -> Vec<EntityRef> {
        let mut out = Vec::new();
        for child_kind in parent.kind.owned_kinds() {
            if let Some(ix) = self.owner_index(*child_kind) {
                if let Some(ids) = ix.get(&parent.id) {
                    out.extend(ids.iter().map(|id| EntityRef::new(*child_kind, id)));
                }
            }
        }
        out
    }

    /// Names of indices whose content differs between `self` and `other`.
    pub fn diff(&self, other: &Indices) -> Vec<String> {
        let mut out = Vec::new();
        let checks = [
            self.meetings_by_workgroup == other.meetings_by_workgroup,
            self.documents_by_meeting == other.documents_by_meeting,
            self.agenda_items_by_meeting == other.agenda_items_by_meeting,
            self.decisions_by_agenda_item == other.decisions_by_agenda_item,
            self.actions_by_agenda_item == other.actions_by_agenda_item,
            self.person_refs == other.person_refs,
            self.people_by_name == other.people_by_name,
        ];
        for (name, same) in INDEX_NAMES.iter().zip(checks.iter()) {
            if !same {
                out.push(name.to_string());
            }
        }
        out
    }

    pub fn save(&self, dir: &Path) -> Result<(), AppError> {
        const CODE: &str = "STORE_INDEX_WRITE_FAILED";
        write_json_atomic(&dir.join("meetings_by_workgroup.json"), &self.meetings_by_workgroup, CODE)?;
        write_json_atomic(&dir.join("documents_by_meeting.json"), &self.documents_by_meeting, CODE)?;
        write_json_atomic(&dir.join("agenda_items_by_meeting.json"), &self.agenda_items_by_meeting, CODE)?;
        write_json_atomic(&dir.join("decisions_by_agenda_item.json"), &self.decisions_by_agenda_item, CODE)?;
        write_json_atomic(&dir.join("actions_by_agenda_item.json"), &self.actions_by_agenda_item, CODE)?;
        write_json_atomic(&dir.join("person_refs.json"), &self.person_refs, CODE)?;
        write_json_atomic(&dir.join("people_by_name.json"), &self.people_by_name, CODE)?;
        Ok(())
    }

    /// Load persisted index files; missing files read as empty.
    pub fn load(dir: &Path) -> Result<Self, AppError> {
        const CODE: &str = "STORE_INDEX_READ_FAILED";
        Ok(Self {
            meetings_by_workgroup: read_json_opt(&dir.join("meetings_by_workgroup.json"), CODE)?.unwrap_or_default(),
            documents_by_meeting: read_json_opt(&dir.join("documents_by_meeting.json"), CODE)?.unwrap_or_default(),
            agenda_items_by_meeting: read_json_opt(&dir.join("agenda_items_by_meeting.json"), CODE)?.unwrap_or_default(),
            decisions_by_agenda_item: read_json_opt(&dir.join("decisions_by_agenda_item.json"), CODE)?.unwrap_or_default(),
            actions_by_agenda_item: read_json_opt(&dir.join("actions_by_agenda_item.json"), CODE)?.unwrap_or_default(),
            person_refs: read_json_opt(&dir.join("person_refs.json"), CODE)?.unwrap_or_default(),
            people_by_name: read_json_opt(&dir.join("people_by_name.json"), CODE)?.unwrap_or_default(),
        })
    }
}
