use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Canonical archive entities.
///
/// Notes:
/// - Ids are strings and stable across re-ingestion of the same source.
/// - Dates are `YYYY-MM-DD`; validation happens in `normalize`, not here.
/// - Optional people references stay `None` rather than pointing at placeholder persons.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Workgroup,
    Meeting,
    Person,
    Document,
    AgendaItem,
    DecisionItem,
    ActionItem,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Workgroup,
        EntityKind::Meeting,
        EntityKind::Person,
        EntityKind::Document,
        EntityKind::AgendaItem,
        EntityKind::DecisionItem,
        EntityKind::ActionItem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Workgroup => "workgroup",
            EntityKind::Meeting => "meeting",
            EntityKind::Person => "person",
            EntityKind::Document => "document",
            EntityKind::AgendaItem => "agenda_item",
            EntityKind::DecisionItem => "decision_item",
            EntityKind::ActionItem => "action_item",
        }
    }

    /// Kinds owned by this kind in the cascade DAG.
    pub fn owned_kinds(&self) -> &'static [EntityKind] {
        match self {
            EntityKind::Meeting => &[EntityKind::Document, EntityKind::AgendaItem],
            EntityKind::AgendaItem => &[EntityKind::DecisionItem, EntityKind::ActionItem],
            _ => &[],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed pointer to a stored entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A persisted entity type. `references` lists every foreign key, including the owner.
pub trait Record: Serialize + DeserializeOwned + Clone {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn references(&self) -> Vec<EntityRef>;

    /// Owning entity in the cascade DAG, if any.
    fn owner(&self) -> Option<EntityRef> {
        None
    }

    fn into_entity(self) -> Entity;

    fn from_entity(entity: Entity) -> Option<Self>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workgroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meeting {
    pub id: String,
    pub workgroup_id: String,
    pub date: String,
    pub host_id: Option<String>,
    pub documenter_id: Option<String>,
    pub purpose: Option<String>,
    #[serde(default)]
    pub attendee_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Canonical body text the chunker indexes.
    pub transcript: String,
    pub source_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersonRole {
    Participant,
    Host,
    Documenter,
    Assignee,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Person {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub role: PersonRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub meeting_id: String,
    pub title: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgendaItem {
    pub id: String,
    pub meeting_id: String,
    pub status: Option<String>,
    pub narrative: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionItem {
    pub id: String,
    pub agenda_item_id: String,
    pub decision: String,
    pub rationale: Option<String>,
    pub effect: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionItem {
    pub id: String,
    pub agenda_item_id: String,
    pub text: String,
    pub assignee_id: Option<String>,
    pub due_date: Option<String>,
    pub status: Option<String>,
}

/// Heterogeneous entity value, used for staged writes and journal replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum Entity {
    Workgroup(Workgroup),
    Meeting(Meeting),
    Person(Person),
    Document(Document),
    AgendaItem(AgendaItem),
    DecisionItem(DecisionItem),
    ActionItem(ActionItem),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Workgroup(_) => EntityKind::Workgroup,
            Entity::Meeting(_) => EntityKind::Meeting,
            Entity::Person(_) => EntityKind::Person,
            Entity::Document(_) => EntityKind::Document,
            Entity::AgendaItem(_) => EntityKind::AgendaItem,
            Entity::DecisionItem(_) => EntityKind::DecisionItem,
            Entity::ActionItem(_) => EntityKind::ActionItem,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Workgroup(r) => r.id(),
            Entity::Meeting(r) => r.id(),
            Entity::Person(r) => r.id(),
            Entity::Document(r) => r.id(),
            Entity::AgendaItem(r) => r.id(),
            Entity::DecisionItem(r) => r.id(),
            Entity::ActionItem(r) => r.id(),
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind(), self.id())
    }

    pub fn references(&self) -> Vec<EntityRef> {
        match self {
            Entity::Workgroup(r) => r.references(),
            Entity::Meeting(r) => r.references(),
            Entity::Person(r) => r.references(),
            Entity::Document(r) => r.references(),
            Entity::AgendaItem(r) => r.references(),
            Entity::DecisionItem(r) => r.references(),
            Entity::ActionItem(r) => r.references(),
        }
    }

    pub fn owner(&self) -> Option<EntityRef> {
        match self {
            Entity::Workgroup(r) => r.owner(),
            Entity::Meeting(r) => r.owner(),
            Entity::Person(r) => r.owner(),
            Entity::Document(r) => r.owner(),
            Entity::AgendaItem(r) => r.owner(),
            Entity::DecisionItem(r) => r.owner(),
            Entity::ActionItem(r) => r.owner(),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Entity::Workgroup(r) => serde_json::to_value(r),
            Entity::Meeting(r) => serde_json::to_value(r),
            Entity::Person(r) => serde_json::to_value(r),
            Entity::Document(r) => serde_json::to_value(r),
            Entity::AgendaItem(r) => serde_json::to_value(r),
            Entity::DecisionItem(r) => serde_json::to_value(r),
            Entity::ActionItem(r) => serde_json::to_value(r),
        }
    }

    pub fn from_json(kind: EntityKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EntityKind::Workgroup => Entity::Workgroup(serde_json::from_value(value)?),
            EntityKind::Meeting => Entity::Meeting(serde_json::from_value(value)?),
            EntityKind::Person => Entity::Person(serde_json::from_value(value)?),
            EntityKind::Document => Entity::Document(serde_json::from_value(value)?),
            EntityKind::AgendaItem => Entity::AgendaItem(serde_json::from_value(value)?),
            EntityKind::DecisionItem => Entity::DecisionItem(serde_json::from_value(value)?),
            EntityKind::ActionItem => Entity::ActionItem(serde_json::from_value(value)?),
        })
    }
}

macro_rules! impl_record {
    ($ty:ident, $kind:ident) => {
        impl Record for $ty {
            const KIND: EntityKind = EntityKind::$kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn references(&self) -> Vec<EntityRef> {
                self.foreign_keys()
            }

            fn owner(&self) -> Option<EntityRef> {
                self.owning_ref()
            }

            fn into_entity(self) -> Entity {
                Entity::$kind(self)
            }

            fn from_entity(entity: Entity) -> Option<Self> {
                match entity {
                    Entity::$kind(r) => Some(r),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Entity {
            fn from(r: $ty) -> Self {
                Entity::$kind(r)
            }
        }
    };
}

impl Workgroup {
    fn foreign_keys(&self) -> Vec<EntityRef> {
        Vec::new()
    }

    fn owning_ref(&self) -> Option<EntityRef> {
        None
    }
}

impl Meeting {
    fn foreign_keys(&self) -> Vec<EntityRef> {
        let mut out = vec![EntityRef::new(EntityKind::Workgroup, &self.workgroup_id)];
        for pid in self
            .host_id
            .iter()
            .chain(self.documenter_id.iter())
            .chain(self.attendee_ids.iter())
        {
            out.push(EntityRef::new(EntityKind::Person, pid));
        }
        out.sort();
        out.dedup();
        out
    }

    // Meetings belong to a workgroup but are not cascade-owned by it.
    fn owning_ref(&self) -> Option<EntityRef> {
        None
    }
}

impl Person {
    fn foreign_keys(&self) -> Vec<EntityRef> {
        Vec::new()
    }

    fn owning_ref(&self) -> Option<EntityRef> {
        None
    }
}

impl Document {
    fn foreign_keys(&self) -> Vec<EntityRef> {
        vec![EntityRef::new(EntityKind::Meeting, &self.meeting_id)]
    }

    fn owning_ref(&self) -> Option<EntityRef> {
        Some(EntityRef::new(EntityKind::Meeting, &self.meeting_id))
    }
}

impl AgendaItem {
    fn foreign_keys(&self) -> Vec<EntityRef> {
        vec![EntityRef::new(EntityKind::Meeting, &self.meeting_id)]
    }

    fn owning_ref(&self) -> Option<EntityRef> {
        Some(EntityRef::new(EntityKind::Meeting, &self.meeting_id))
    }
}

impl DecisionItem {
    fn foreign_keys(&self) -> Vec<EntityRef> {
        vec![EntityRef::new(EntityKind::AgendaItem, &self.agenda_item_id)]
    }

    fn owning_ref(&self) -> Option<EntityRef> {
        Some(EntityRef::new(EntityKind::AgendaItem, &self.agenda_item_id))
    }
}

impl ActionItem {
    fn foreign_keys(&self) -> Vec<EntityRef> {
        let mut out = vec![EntityRef::new(EntityKind::AgendaItem, &self.agenda_item_id)];
        if let Some(pid) = self.assignee_id.as_ref() {
            out.push(EntityRef::new(EntityKind::Person, pid));
        }
        out
    }

    fn owning_ref(&self) -> Option<EntityRef> {
        Some(EntityRef::new(EntityKind::AgendaItem, &self.agenda_item_id))
    }
}

impl_record!(Workgroup, Workgroup);
impl_record!(Meeting, Meeting);
impl_record!(Person, Person);
impl_record!(Document, Document);
impl_record!(AgendaItem, AgendaItem);
impl_record!(DecisionItem, DecisionItem);
impl_record!(ActionItem, ActionItem);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationWarning {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl ValidationWarning {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_dag_is_meeting_then_agenda_item() {
        assert_eq!(
            EntityKind::Meeting.owned_kinds(),
            &[EntityKind::Document, EntityKind::AgendaItem]
        );
        assert_eq!(
            EntityKind::AgendaItem.owned_kinds(),
            &[EntityKind::DecisionItem, EntityKind::ActionItem]
        );
        assert!(EntityKind::Person.owned_kinds().is_empty());
        assert!(EntityKind::Workgroup.owned_kinds().is_empty());
    }

    #[test]
    fn meeting_references_cover_workgroup_and_people() {
        let m = Meeting {
            id: "m1".to_string(),
            workgroup_id: "wg".to_string(),
            date: "2024-03-15".to_string(),
            host_id: Some("p1".to_string()),
            documenter_id: Some("p1".to_string()),
            purpose: None,
            attendee_ids: vec!["p2".to_string()],
            tags: vec![],
            transcript: String::new(),
            source_sha256: String::new(),
        };
        let refs = m.references();
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&EntityRef::new(EntityKind::Workgroup, "wg")));
        assert!(refs.contains(&EntityRef::new(EntityKind::Person, "p2")));
        assert!(m.owner().is_none());
    }
}
