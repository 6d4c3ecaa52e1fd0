//! File-backed entity store.
//!
//! Layout under the store root:
//! - `entities/<kind>/<id>.json`: primary records, one file per entity.
//! - `indices/<name>.json`: secondary indices, always reconstructible from primary records.
//! - `journal/<txn>.json`: write-ahead entries for commits that have not finished applying.
//! - `flags/person_matches.json`: person matches held back for review.
//!
//! Every write goes through a `Transaction`. Commit validates foreign keys against the
//! state the commit would produce, journals the op list, applies it and then drops the
//! journal entry. `open` replays whatever is left in the journal, so a crash mid-commit
//! resolves to the complete commit on the next open.

pub mod indices;
pub mod journal;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{Entity, EntityKind, EntityRef, Record};
use crate::error::{AppError, ErrorKind};
use crate::fsio::{ensure_dir, read_json_opt, remove_file_if_exists, write_json_atomic};
use crate::normalize::names::normalize_name;
use crate::people::PersonMatchFlag;

use indices::Indices;
use journal::{Journal, JournalEntry};

/// Selection for `EntityStore::query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    /// Children filed under the given owner id (meetings under a workgroup, agenda items
    /// under a meeting, ...).
    Owner(String),
    /// Entities of the queried kind that reference the given person.
    ReferencesPerson(String),
    /// Persons whose display name or alias folds to the same normalized name.
    NameMatches(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitSummary {
    pub txn_id: String,
    pub written: Vec<EntityRef>,
    pub deleted: Vec<EntityRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Index names whose in-memory or persisted form differs from a rebuild.
    pub divergent: Vec<String>,
    /// Entities holding a reference that no longer resolves, as `kind:id -> kind:id`.
    pub dangling: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.divergent.is_empty() && self.dangling.is_empty()
    }
}

fn poisoned() -> AppError {
    AppError::storage("STORE_LOCK_POISONED", "Entity store lock was poisoned")
}

fn validate_store_id(r: &EntityRef) -> Result<(), AppError> {
    let bad = r.id.is_empty()
        || r.id == "."
        || r.id == ".."
        || r.id
            .chars()
            .any(|c| matches!(c, '/' | '\\') || c.is_control());
    if bad {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            "STORE_ID_INVALID",
            "Entity id cannot be used as a record key",
        )
        .with_details(format!("entity={r}")));
    }
    Ok(())
}

pub struct EntityStore {
    root: PathBuf,
    journal: Journal,
    state: RwLock<Indices>,
    subtree_locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
    flags_lock: Mutex<()>,
    txn_seq: AtomicU64,
}

impl EntityStore {
    /// Open (or create) a store rooted at `root`, replaying any unfinished commits.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, AppError> {
        let root = root.as_ref().to_path_buf();
        for kind in EntityKind::ALL {
            ensure_dir(&root.join("entities").join(kind.as_str()), "STORE_OPEN_FAILED")?;
        }
        ensure_dir(&root.join("indices"), "STORE_OPEN_FAILED")?;
        ensure_dir(&root.join("flags"), "STORE_OPEN_FAILED")?;

        let journal = Journal::new(root.join("journal"));
        let store = Self {
            root,
            journal,
            state: RwLock::new(Indices::default()),
            subtree_locks: Mutex::new(BTreeMap::new()),
            flags_lock: Mutex::new(()),
            txn_seq: AtomicU64::new(0),
        };

        let pending = store.journal.pending()?;
        for entry in pending.iter() {
            warn!(txn = %entry.txn_id, "replaying unfinished store commit");
            store.apply_files(entry)?;
            store.journal.clear(&entry.txn_id)?;
        }

        let all = store.scan_all()?;
        let rebuilt = Indices::build(all.iter());
        let persisted = Indices::load(&store.indices_dir())?;
        let divergent = rebuilt.diff(&persisted);
        if !divergent.is_empty() {
            warn!(indices = ?divergent, "persisted indices diverged from records; rewriting");
        }
        rebuilt.save(&store.indices_dir())?;
        {
            let mut ix = store.state.write().map_err(|_| poisoned())?;
            *ix = rebuilt;
        }
        info!(root = %store.root.display(), entities = all.len(), "entity store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn indices_dir(&self) -> PathBuf {
        self.root.join("indices")
    }

    fn kind_dir(&self, kind: EntityKind) -> PathBuf {
        self.root.join("entities").join(kind.as_str())
    }

    fn entity_path(&self, r: &EntityRef) -> PathBuf {
        self.kind_dir(r.kind).join(format!("{}.json", r.id))
    }

    fn flags_path(&self) -> PathBuf {
        self.root.join("flags").join("person_matches.json")
    }

    fn read_entity(&self, r: &EntityRef) -> Result<Option<Entity>, AppError> {
        let Some(value) = read_json_opt::<serde_json::Value>(&self.entity_path(r), "STORE_READ_FAILED")?
        else {
            return Ok(None);
        };
        Entity::from_json(r.kind, value).map(Some).map_err(|e| {
            AppError::storage("STORE_RECORD_CORRUPT", "Stored record does not decode")
                .with_details(format!("entity={r}; err={e}"))
        })
    }

    fn write_entity(&self, e: &Entity) -> Result<(), AppError> {
        let value = e.to_json().map_err(|err| {
            AppError::storage("STORE_WRITE_FAILED", "Failed to encode record")
                .with_details(format!("entity={}; err={}", e.entity_ref(), err))
        })?;
        write_json_atomic(&self.entity_path(&e.entity_ref()), &value, "STORE_WRITE_FAILED")
    }

    fn ids_of_kind(&self, kind: EntityKind) -> Result<Vec<String>, AppError> {
        let dir = self.kind_dir(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = fs::read_dir(&dir)
            .map_err(|e| {
                AppError::storage("STORE_READ_FAILED", "Failed to list records")
                    .with_details(format!("path={}; err={}", dir.display(), e))
            })?
            .filter_map(|ent| ent.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string()))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Every primary record, grouped by kind and ordered by id.
    fn scan_all(&self) -> Result<Vec<Entity>, AppError> {
        let mut out = Vec::new();
        for kind in EntityKind::ALL {
            for id in self.ids_of_kind(kind)? {
                if let Some(e) = self.read_entity(&EntityRef::new(kind, id))? {
                    out.push(e);
                }
            }
        }
        Ok(out)
    }

    fn apply_files(&self, entry: &JournalEntry) -> Result<(), AppError> {
        for d in entry.deletes.iter() {
            remove_file_if_exists(&self.entity_path(d), "STORE_DELETE_FAILED")?;
        }
        for p in entry.puts.iter() {
            self.write_entity(p)?;
        }
        Ok(())
    }

    // ----- reads -----

    pub fn load<R: Record>(&self, id: &str) -> Result<R, AppError> {
        let entity = self.load_entity(R::KIND, id)?;
        R::from_entity(entity).ok_or_else(|| {
            AppError::storage("STORE_RECORD_CORRUPT", "Stored record has the wrong kind")
                .with_details(format!("kind={}; id={}", R::KIND, id))
        })
    }

    pub fn load_entity(&self, kind: EntityKind, id: &str) -> Result<Entity, AppError> {
        let r = EntityRef::new(kind, id);
        validate_store_id(&r)?;
        let _ix = self.state.read().map_err(|_| poisoned())?;
        self.read_entity(&r)?.ok_or_else(|| {
            AppError::new(ErrorKind::NotFound, "STORE_NOT_FOUND", "Entity not found")
                .with_details(format!("entity={r}"))
        })
    }

    pub fn exists(&self, kind: EntityKind, id: &str) -> Result<bool, AppError> {
        let r = EntityRef::new(kind, id);
        validate_store_id(&r)?;
        let _ix = self.state.read().map_err(|_| poisoned())?;
        Ok(self.entity_path(&r).exists())
    }

    pub fn list<R: Record>(&self) -> Result<Vec<R>, AppError> {
        self.query(&Filter::All)
    }

    pub fn query<R: Record>(&self, filter: &Filter) -> Result<Vec<R>, AppError> {
        let ix = self.state.read().map_err(|_| poisoned())?;
        let ids: Vec<String> = match filter {
            Filter::All => self.ids_of_kind(R::KIND)?,
            Filter::Owner(owner) => {
                let index = ix.owner_index(R::KIND).ok_or_else(|| unsupported(R::KIND, filter))?;
                index
                    .get(owner)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default()
            }
            Filter::ReferencesPerson(pid) => ix
                .person_refs
                .get(pid)
                .map(|refs| {
                    refs.iter()
                        .filter(|r| r.kind == R::KIND)
                        .map(|r| r.id.clone())
                        .collect()
                })
                .unwrap_or_default(),
            Filter::NameMatches(name) => {
                if R::KIND != EntityKind::Person {
                    return Err(unsupported(R::KIND, filter));
                }
                ix.people_by_name
                    .get(&normalize_name(name))
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default()
            }
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let r = EntityRef::new(R::KIND, id);
            let Some(e) = self.read_entity(&r)? else {
                return Err(AppError::new(
                    ErrorKind::Integrity,
                    "STORE_INDEX_STALE",
                    "Index points at a record that does not exist",
                )
                .with_details(format!("entity={r}")));
            };
            if let Some(rec) = R::from_entity(e) {
                out.push(rec);
            }
        }
        Ok(out)
    }

    // ----- writes -----

    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            puts: BTreeMap::new(),
            deletes: BTreeSet::new(),
        }
    }

    pub fn save<R: Record>(&self, record: R) -> Result<CommitSummary, AppError> {
        let mut txn = self.begin();
        txn.put(record);
        txn.commit()
    }

    /// Delete an entity and everything it owns. Returns every removed ref.
    pub fn delete(&self, kind: EntityKind, id: &str) -> Result<Vec<EntityRef>, AppError> {
        let mut txn = self.begin();
        txn.delete_cascade(kind, id);
        Ok(txn.commit()?.deleted)
    }

    /// Swap a meeting subtree for a freshly normalized one in a single commit. Children of
    /// the old version that are not re-put are removed.
    pub fn replace_meeting(
        &self,
        meeting_id: &str,
        entities: Vec<Entity>,
    ) -> Result<CommitSummary, AppError> {
        let mut txn = self.begin();
        if self.exists(EntityKind::Meeting, meeting_id)? {
            txn.delete_cascade(EntityKind::Meeting, meeting_id);
        }
        for e in entities {
            txn.put_entity(e);
        }
        txn.commit()
    }

    fn next_txn_id(&self) -> String {
        let seq = self.txn_seq.fetch_add(1, Ordering::SeqCst);
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos().max(0);
        format!("{nanos:024}-{seq:06}")
    }

    /// Lock key of the subtree an entity write belongs to.
    fn subtree_key(&self, r: &EntityRef, staged: &BTreeMap<EntityRef, Entity>) -> Result<String, AppError> {
        let lookup = |r: &EntityRef| -> Result<Option<Entity>, AppError> {
            match staged.get(r) {
                Some(e) => Ok(Some(e.clone())),
                None => self.read_entity(r),
            }
        };
        let mut cur = r.clone();
        // Walk owner links up to the cascade root.
        for _ in 0..4 {
            match lookup(&cur)?.and_then(|e| e.owner()) {
                Some(owner) => cur = owner,
                None => break,
            }
        }
        Ok(format!("{}:{}", cur.kind, cur.id))
    }

    fn subtree_handles(&self, keys: &BTreeSet<String>) -> Result<Vec<Arc<Mutex<()>>>, AppError> {
        let mut map = self.subtree_locks.lock().map_err(|_| poisoned())?;
        Ok(keys
            .iter()
            .map(|k| map.entry(k.clone()).or_default().clone())
            .collect())
    }

    fn commit(
        &self,
        puts: BTreeMap<EntityRef, Entity>,
        deletes: BTreeSet<EntityRef>,
    ) -> Result<CommitSummary, AppError> {
        for r in puts.keys().chain(deletes.iter()) {
            validate_store_id(r)?;
        }
        if puts.is_empty() && deletes.is_empty() {
            return Ok(CommitSummary::default());
        }

        let keys: BTreeSet<String> = {
            let _ix = self.state.read().map_err(|_| poisoned())?;
            let mut keys = BTreeSet::new();
            for r in puts.keys().chain(deletes.iter()) {
                keys.insert(self.subtree_key(r, &puts)?);
            }
            keys
        };
        // Sorted acquisition keeps multi-subtree commits deadlock free.
        let handles = self.subtree_handles(&keys)?;
        let mut guards = Vec::with_capacity(handles.len());
        for h in handles.iter() {
            guards.push(h.lock().map_err(|_| poisoned())?);
        }

        let mut ix = self.state.write().map_err(|_| poisoned())?;

        let mut doomed: BTreeSet<EntityRef> = BTreeSet::new();
        let mut work: Vec<EntityRef> = Vec::new();
        for d in deletes.iter() {
            if !self.entity_path(d).exists() && !puts.contains_key(d) {
                return Err(AppError::new(
                    ErrorKind::NotFound,
                    "STORE_NOT_FOUND",
                    "Cannot delete an entity that does not exist",
                )
                .with_details(format!("entity={d}")));
            }
            work.push(d.clone());
        }
        while let Some(r) = work.pop() {
            if doomed.insert(r.clone()) {
                work.extend(ix.children(&r));
            }
        }
        // A put in the same commit wins over a delete of the same ref.
        doomed.retain(|r| !puts.contains_key(r));

        for r in doomed.iter() {
            let live: Vec<String> = match r.kind {
                EntityKind::Person => ix
                    .person_refs
                    .get(&r.id)
                    .map(|refs| {
                        refs.iter()
                            .filter(|x| !doomed.contains(x) && !puts.contains_key(x))
                            .map(|x| x.to_string())
                            .collect()
                    })
                    .unwrap_or_default(),
                EntityKind::Workgroup => ix
                    .meetings_by_workgroup
                    .get(&r.id)
                    .map(|ids| {
                        ids.iter()
                            .map(|id| EntityRef::new(EntityKind::Meeting, id))
                            .filter(|x| !doomed.contains(x) && !puts.contains_key(x))
                            .map(|x| x.to_string())
                            .collect()
                    })
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            if !live.is_empty() {
                return Err(AppError::new(
                    ErrorKind::ReferentialIntegrity,
                    "STORE_DELETE_RESTRICTED",
                    "Entity is still referenced and cannot be deleted",
                )
                .with_details(format!("entity={}; referenced_by={}", r, live.join(","))));
            }
        }

        for e in puts.values() {
            for target in e.references() {
                let resolved = puts.contains_key(&target)
                    || (!doomed.contains(&target) && self.entity_path(&target).exists());
                if !resolved {
                    return Err(AppError::new(
                        ErrorKind::ReferentialIntegrity,
                        "STORE_FK_UNRESOLVED",
                        "Reference does not resolve to a stored entity",
                    )
                    .with_details(format!("entity={}; missing={}", e.entity_ref(), target)));
                }
            }
        }

        let entry = JournalEntry {
            txn_id: self.next_txn_id(),
            deletes: doomed.iter().cloned().collect(),
            puts: puts.values().cloned().collect(),
        };
        self.journal.write(&entry)?;

        if let Err(e) = self.apply_with_indices(&entry, &mut ix) {
            // Leave the journal in place; the next open finishes the commit.
            if let Ok(all) = self.scan_all() {
                *ix = Indices::build(all.iter());
            }
            return Err(e);
        }
        ix.save(&self.indices_dir())?;
        self.journal.clear(&entry.txn_id)?;
        drop(ix);
        drop(guards);

        info!(
            txn = %entry.txn_id,
            puts = entry.puts.len(),
            deletes = entry.deletes.len(),
            "store commit applied"
        );
        Ok(CommitSummary {
            txn_id: entry.txn_id,
            written: puts.keys().cloned().collect(),
            deleted: doomed.into_iter().collect(),
        })
    }

    fn apply_with_indices(&self, entry: &JournalEntry, ix: &mut Indices) -> Result<(), AppError> {
        for d in entry.deletes.iter() {
            if let Some(old) = self.read_entity(d)? {
                ix.remove(&old);
            }
            remove_file_if_exists(&self.entity_path(d), "STORE_DELETE_FAILED")?;
            debug!(entity = %d, "record deleted");
        }
        for p in entry.puts.iter() {
            if let Some(old) = self.read_entity(&p.entity_ref())? {
                ix.remove(&old);
            }
            self.write_entity(p)?;
            ix.insert(p);
        }
        Ok(())
    }

    // ----- maintenance -----

    /// Rebuild indices from primary records and compare them with the in-memory and
    /// persisted copies. Nothing is rewritten.
    pub fn check_consistency(&self) -> Result<ConsistencyReport, AppError> {
        let ix = self.state.read().map_err(|_| poisoned())?;
        let all = self.scan_all()?;
        let rebuilt = Indices::build(all.iter());
        let persisted = Indices::load(&self.indices_dir())?;

        let mut divergent: BTreeSet<String> = rebuilt.diff(&ix).into_iter().collect();
        divergent.extend(rebuilt.diff(&persisted));

        let present: BTreeSet<EntityRef> = all.iter().map(|e| e.entity_ref()).collect();
        let mut dangling = Vec::new();
        for e in all.iter() {
            for target in e.references() {
                if !present.contains(&target) {
                    dangling.push(format!("{} -> {}", e.entity_ref(), target));
                }
            }
        }

        Ok(ConsistencyReport {
            divergent: divergent.into_iter().collect(),
            dangling,
        })
    }

    pub fn rebuild_indices(&self) -> Result<(), AppError> {
        let mut ix = self.state.write().map_err(|_| poisoned())?;
        let all = self.scan_all()?;
        let rebuilt = Indices::build(all.iter());
        rebuilt.save(&self.indices_dir())?;
        *ix = rebuilt;
        info!(entities = all.len(), "indices rebuilt from records");
        Ok(())
    }

    pub fn counts(&self) -> Result<BTreeMap<EntityKind, usize>, AppError> {
        let _ix = self.state.read().map_err(|_| poisoned())?;
        let mut out = BTreeMap::new();
        for kind in EntityKind::ALL {
            out.insert(kind, self.ids_of_kind(kind)?.len());
        }
        Ok(out)
    }

    /// Append person-match flags for review, skipping ones already recorded.
    pub fn record_person_flags(&self, flags: &[PersonMatchFlag]) -> Result<usize, AppError> {
        if flags.is_empty() {
            return Ok(0);
        }
        let _g = self.flags_lock.lock().map_err(|_| poisoned())?;
        let mut existing: Vec<PersonMatchFlag> =
            read_json_opt(&self.flags_path(), "STORE_FLAGS_READ_FAILED")?.unwrap_or_default();
        let mut added = 0;
        for f in flags {
            if !existing.contains(f) {
                existing.push(f.clone());
                added += 1;
            }
        }
        if added > 0 {
            write_json_atomic(&self.flags_path(), &existing, "STORE_FLAGS_WRITE_FAILED")?;
        }
        Ok(added)
    }

    pub fn list_person_flags(&self) -> Result<Vec<PersonMatchFlag>, AppError> {
        let _g = self.flags_lock.lock().map_err(|_| poisoned())?;
        Ok(read_json_opt(&self.flags_path(), "STORE_FLAGS_READ_FAILED")?.unwrap_or_default())
    }
}

fn unsupported(kind: EntityKind, filter: &Filter) -> AppError {
    AppError::new(
        ErrorKind::InvalidInput,
        "STORE_FILTER_UNSUPPORTED",
        "Filter is not supported for this entity kind",
    )
    .with_details(format!("kind={kind}; filter={filter:?}"))
}

/// Staged writes. Nothing touches disk until `commit`.
pub struct Transaction<'a> {
    store: &'a EntityStore,
    puts: BTreeMap<EntityRef, Entity>,
    deletes: BTreeSet<EntityRef>,
}

impl Transaction<'_> {
    pub fn put<R: Record>(&mut self, record: R) -> &mut Self {
        self.put_entity(record.into_entity())
    }

    pub fn put_entity(&mut self, entity: Entity) -> &mut Self {
        self.puts.insert(entity.entity_ref(), entity);
        self
    }

    /// Stage deletion of an entity and, at commit time, everything it owns.
    pub fn delete_cascade(&mut self, kind: EntityKind, id: &str) -> &mut Self {
        self.deletes.insert(EntityRef::new(kind, id));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    pub fn commit(self) -> Result<CommitSummary, AppError> {
        self.store.commit(self.puts, self.deletes)
    }
}
