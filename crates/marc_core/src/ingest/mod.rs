//! Meeting ingestion: raw JSON files -> normalized meetings -> entity store commits.
//!
//! One file is one meeting. Input problems (malformed JSON, unresolved references, a source
//! hash that no longer matches the ledger, a meeting id already owned by another source) skip
//! that file and the batch carries on; storage failures abort the batch.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Settings;
use crate::domain::{
    ActionItem, AgendaItem, DecisionItem, Document, Entity, EntityKind, Meeting, PersonRole,
    ValidationWarning, Workgroup,
};
use crate::error::{AppError, ErrorKind};
use crate::fsio::{read_json_opt, write_json_atomic};
use crate::integrity::sha256_hex;
use crate::normalize::{normalize, parse_meeting_json, InputForm, NormalizedMeeting};
use crate::people::{PersonMatchFlag, PersonResolver};
use crate::store::EntityStore;

const LEDGER_FILE: &str = "sources.json";
const OWNERS_FILE: &str = "meeting_sources.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestOptions {
    /// Reject a source whose bytes no longer hash to the recorded value.
    pub verify_hash: bool,
    /// Expected SHA-256 per path, checked ahead of the ledger when present.
    #[serde(default)]
    pub expected_sha256: BTreeMap<String, String>,
}

impl IngestOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            verify_hash: settings.ingest.verify_hash,
            expected_sha256: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestedMeeting {
    pub meeting_id: String,
    pub form: InputForm,
    pub source_sha256: String,
    pub entities_written: usize,
    pub entities_removed: usize,
    pub warnings: Vec<ValidationWarning>,
    pub person_flags: Vec<PersonMatchFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Ingested(IngestedMeeting),
    Skipped { error: AppError },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileReport {
    pub path: String,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    pub files: Vec<FileReport>,
    pub ingested: usize,
    pub skipped: usize,
}

impl IngestReport {
    pub fn person_flags(&self) -> Vec<PersonMatchFlag> {
        self.files
            .iter()
            .filter_map(|f| match &f.outcome {
                FileOutcome::Ingested(m) => Some(m.person_flags.clone()),
                FileOutcome::Skipped { .. } => None,
            })
            .flatten()
            .collect()
    }

    pub fn outcome_for(&self, path: &str) -> Option<&FileOutcome> {
        self.files.iter().find(|f| f.path == path).map(|f| &f.outcome)
    }
}

/// Errors that skip a single source instead of aborting the batch.
fn is_per_record(err: &AppError) -> bool {
    matches!(
        err.kind,
        ErrorKind::MalformedInput
            | ErrorKind::ReferentialIntegrity
            | ErrorKind::HashMismatch
            | ErrorKind::InvalidInput
            | ErrorKind::Conflict
    )
}

pub struct Ingestor<'a> {
    store: &'a EntityStore,
    settings: &'a Settings,
}

impl<'a> Ingestor<'a> {
    pub fn new(store: &'a EntityStore, settings: &'a Settings) -> Self {
        Self { store, settings }
    }

    fn ledger_path(&self) -> PathBuf {
        self.store.root().join(LEDGER_FILE)
    }

    /// Recorded `path -> sha256` of every source ingested so far.
    pub fn source_ledger(&self) -> Result<BTreeMap<String, String>, AppError> {
        Ok(read_json_opt(&self.ledger_path(), "INGEST_LEDGER_READ_FAILED")?.unwrap_or_default())
    }

    fn owners_path(&self) -> PathBuf {
        self.store.root().join(OWNERS_FILE)
    }

    /// Recorded `meeting_id -> source label` of every ingested meeting.
    pub fn meeting_sources(&self) -> Result<BTreeMap<String, String>, AppError> {
        Ok(read_json_opt(&self.owners_path(), "INGEST_OWNERS_READ_FAILED")?.unwrap_or_default())
    }

    /// A stored meeting may only be replaced by the source that produced it.
    fn check_meeting_owner(
        &self,
        label: &str,
        meeting_id: &str,
        owners: &BTreeMap<String, String>,
    ) -> Result<(), AppError> {
        if !self.store.exists(EntityKind::Meeting, meeting_id)? {
            return Ok(());
        }
        match owners.get(meeting_id) {
            Some(owner) if owner == label => Ok(()),
            owner => Err(AppError::new(
                ErrorKind::Conflict,
                "INGEST_MEETING_ID_COLLISION",
                "Meeting id is already claimed by another source",
            )
            .with_details(format!(
                "meeting_id={meeting_id}; source={label}; owner={}",
                owner.map(String::as_str).unwrap_or("unknown")
            ))),
        }
    }

    fn resolver(&self) -> Result<PersonResolver, AppError> {
        Ok(PersonResolver::new(&self.settings.people, self.store.list()?))
    }

    pub fn ingest_files(
        &self,
        paths: &[PathBuf],
        options: &IngestOptions,
    ) -> Result<IngestReport, AppError> {
        let mut sorted: Vec<&PathBuf> = paths.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut ledger = self.source_ledger()?;
        let mut resolver = self.resolver()?;
        let mut report = IngestReport::default();

        for path in sorted {
            let key = path.display().to_string();
            // Persons created for a file that ends up skipped must not leak into the next one.
            let checkpoint = resolver.clone();
            match self.ingest_file(path, &key, options, &ledger, &mut resolver) {
                Ok((meeting, file_sha)) => {
                    ledger.insert(key.clone(), file_sha);
                    write_json_atomic(&self.ledger_path(), &ledger, "INGEST_LEDGER_WRITE_FAILED")?;
                    report.ingested += 1;
                    report.files.push(FileReport {
                        path: key,
                        outcome: FileOutcome::Ingested(meeting),
                    });
                }
                Err(err) if is_per_record(&err) => {
                    warn!(path = %key, code = %err.code, kind = %err.kind, "skipped meeting source");
                    resolver = checkpoint;
                    report.skipped += 1;
                    report.files.push(FileReport {
                        path: key,
                        outcome: FileOutcome::Skipped { error: err },
                    });
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            ingested = report.ingested,
            skipped = report.skipped,
            "ingestion batch finished"
        );
        Ok(report)
    }

    fn ingest_file(
        &self,
        path: &Path,
        key: &str,
        options: &IngestOptions,
        ledger: &BTreeMap<String, String>,
        resolver: &mut PersonResolver,
    ) -> Result<(IngestedMeeting, String), AppError> {
        let bytes = fs::read(path).map_err(|e| {
            AppError::malformed("INGEST_READ_FAILED", "Failed to read meeting source")
                .with_details(format!("path={}; err={}", path.display(), e))
        })?;
        let file_sha = sha256_hex(&bytes);

        if options.verify_hash {
            let expected = options
                .expected_sha256
                .get(key)
                .or_else(|| ledger.get(key));
            if let Some(expected) = expected {
                if !expected.eq_ignore_ascii_case(&file_sha) {
                    return Err(AppError::new(
                        ErrorKind::HashMismatch,
                        "INGEST_HASH_MISMATCH",
                        "Source changed since it was recorded; refusing to ingest",
                    )
                    .with_details(format!(
                        "path={key}; expected={expected}; actual={file_sha}"
                    )));
                }
            }
        }

        let text = String::from_utf8(bytes).map_err(|e| {
            AppError::malformed("INGEST_NOT_UTF8", "Meeting source is not valid UTF-8")
                .with_details(format!("path={key}; err={e}"))
        })?;
        let meeting = self.ingest_text(key, &text, resolver)?;
        Ok((meeting, file_sha))
    }

    /// Ingest one in-memory meeting document. `label` names it in logs and flags.
    pub fn ingest_json(&self, label: &str, text: &str) -> Result<IngestedMeeting, AppError> {
        let mut resolver = self.resolver()?;
        self.ingest_text(label, text, &mut resolver)
    }

    fn ingest_text(
        &self,
        label: &str,
        text: &str,
        resolver: &mut PersonResolver,
    ) -> Result<IngestedMeeting, AppError> {
        let raw = parse_meeting_json(text)?;
        let normalized = normalize(raw)?;
        self.commit_meeting(label, normalized, resolver)
    }

    fn commit_meeting(
        &self,
        label: &str,
        m: NormalizedMeeting,
        resolver: &mut PersonResolver,
    ) -> Result<IngestedMeeting, AppError> {
        let mut owners = self.meeting_sources()?;
        self.check_meeting_owner(label, &m.meeting_id, &owners)?;

        let flags_before = resolver.flags().len();
        let context = format!("{label}#{}", m.meeting_id);

        let mut resolve = |name: Option<&String>, role: PersonRole| -> Option<String> {
            name.and_then(|n| resolver.resolve(n, role, &context).person_id)
        };
        let host_id = resolve(m.host.as_ref(), PersonRole::Host);
        let documenter_id = resolve(m.documenter.as_ref(), PersonRole::Documenter);
        let mut attendee_ids: Vec<String> = Vec::new();
        for name in m.attendees.iter() {
            if let Some(id) = resolve(Some(name), PersonRole::Participant) {
                if !attendee_ids.contains(&id) {
                    attendee_ids.push(id);
                }
            }
        }

        let mut children: Vec<Entity> = Vec::new();
        for d in m.documents.iter() {
            children.push(Entity::Document(Document {
                id: d.id.clone(),
                meeting_id: m.meeting_id.clone(),
                title: d.title.clone(),
                link: d.link.clone(),
            }));
        }
        for item in m.agenda_items.iter() {
            children.push(Entity::AgendaItem(AgendaItem {
                id: item.id.clone(),
                meeting_id: m.meeting_id.clone(),
                status: item.status.clone(),
                narrative: item.narrative.clone(),
            }));
            for d in item.decisions.iter() {
                children.push(Entity::DecisionItem(DecisionItem {
                    id: d.id.clone(),
                    agenda_item_id: item.id.clone(),
                    decision: d.decision.clone(),
                    rationale: d.rationale.clone(),
                    effect: d.effect.clone(),
                }));
            }
            for a in item.actions.iter() {
                let assignee_id = resolve(a.assignee.as_ref(), PersonRole::Assignee);
                children.push(Entity::ActionItem(ActionItem {
                    id: a.id.clone(),
                    agenda_item_id: item.id.clone(),
                    text: a.text.clone(),
                    assignee_id,
                    due_date: a.due_date.clone(),
                    status: a.status.clone(),
                }));
            }
        }

        let mut entities: Vec<Entity> = Vec::new();
        if !self.store.exists(EntityKind::Workgroup, &m.workgroup_id)? {
            entities.push(Entity::Workgroup(Workgroup {
                id: m.workgroup_id.clone(),
                name: m.workgroup_name.clone(),
            }));
        }
        entities.extend(resolver.touched().into_iter().map(Entity::Person));
        entities.push(Entity::Meeting(Meeting {
            id: m.meeting_id.clone(),
            workgroup_id: m.workgroup_id.clone(),
            date: m.date.clone(),
            host_id,
            documenter_id,
            purpose: m.purpose.clone(),
            attendee_ids,
            tags: m.tags.clone(),
            transcript: m.body_text.clone(),
            source_sha256: m.source_sha256.clone(),
        }));
        entities.extend(children);

        let summary = self.store.replace_meeting(&m.meeting_id, entities)?;
        owners.insert(m.meeting_id.clone(), label.to_string());
        write_json_atomic(&self.owners_path(), &owners, "INGEST_OWNERS_WRITE_FAILED")?;
        let new_flags: Vec<PersonMatchFlag> = resolver.flags()[flags_before..].to_vec();
        self.store.record_person_flags(&new_flags)?;

        info!(
            meeting = %m.meeting_id,
            form = ?m.form,
            written = summary.written.len(),
            removed = summary.deleted.len(),
            "meeting ingested"
        );
        Ok(IngestedMeeting {
            meeting_id: m.meeting_id,
            form: m.form,
            source_sha256: m.source_sha256,
            entities_written: summary.written.len(),
            entities_removed: summary.deleted.len(),
            warnings: m.warnings,
            person_flags: new_flags,
        })
    }
}
