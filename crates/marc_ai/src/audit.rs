//! Write-once audit log: one JSON file per query id.
//!
//! An entry is written to a private temp file and then hard-linked into place. The link
//! fails if the name already exists, so an entry is never overwritten and never appears
//! half-written.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use marc_core::error::{AppError, ErrorKind};
use marc_core::fsio::ensure_dir;
use marc_core::integrity::{canonical_json_string, sha256_hex};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::providers::Degradation;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Answered,
    NoEvidence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecordInput {
    pub query_id: String,
    pub query_text: String,
    pub answer_text: String,
    pub citations: Vec<String>,
    pub outcome: QueryOutcome,
    pub generator: Option<String>,
    pub model_version: String,
    pub embedding_version: String,
    pub index_generation: String,
    pub degradations: Vec<Degradation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub query_id: String,
    pub timestamp: String,
    pub query_text: String,
    pub answer_text: String,
    pub answer_sha256: String,
    pub citations: Vec<String>,
    pub outcome: QueryOutcome,
    pub generator: Option<String>,
    pub model_version: String,
    pub embedding_version: String,
    pub index_generation: String,
    pub degradations: Vec<Degradation>,
    /// SHA-256 of the canonical entry JSON with this field empty.
    pub entry_sha256: String,
}

impl AuditLogEntry {
    fn compute_entry_sha256(&self) -> Result<String, AppError> {
        let mut blank = self.clone();
        blank.entry_sha256 = String::new();
        let value = serde_json::to_value(&blank).map_err(|e| {
            audit_error("AUDIT_ENCODE_FAILED", "Failed to encode audit entry").with_details(e.to_string())
        })?;
        Ok(sha256_hex(canonical_json_string(&value)?.as_bytes()))
    }
}

fn audit_error(code: &str, message: &str) -> AppError {
    AppError::new(ErrorKind::AuditWriteFailure, code, message)
}

fn validate_query_id(query_id: &str) -> Result<(), AppError> {
    let ok = !query_id.is_empty()
        && !query_id.starts_with('.')
        && query_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            "AUDIT_QUERY_ID_INVALID",
            "Query id must be a plain file-safe token",
        )
        .with_details(format!("query_id={query_id}")));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, AppError> {
        let dir = dir.as_ref().to_path_buf();
        ensure_dir(&dir, "AUDIT_DIR_FAILED")?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, query_id: &str) -> PathBuf {
        self.dir.join(format!("{query_id}.json"))
    }

    pub fn record(&self, input: AuditRecordInput) -> Result<AuditLogEntry, AppError> {
        validate_query_id(&input.query_id)?;
        let path = self.entry_path(&input.query_id);
        if path.exists() {
            return Err(audit_error("AUDIT_ENTRY_EXISTS", "Audit entry already exists")
                .with_details(format!("query_id={}", input.query_id)));
        }

        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339).map_err(|e| {
            audit_error("AUDIT_ENCODE_FAILED", "Failed to format timestamp").with_details(e.to_string())
        })?;
        let mut entry = AuditLogEntry {
            query_id: input.query_id,
            timestamp,
            query_text: input.query_text,
            answer_sha256: sha256_hex(input.answer_text.as_bytes()),
            answer_text: input.answer_text,
            citations: input.citations,
            outcome: input.outcome,
            generator: input.generator,
            model_version: input.model_version,
            embedding_version: input.embedding_version,
            index_generation: input.index_generation,
            degradations: input.degradations,
            entry_sha256: String::new(),
        };
        entry.entry_sha256 = entry.compute_entry_sha256()?;

        let json = serde_json::to_vec_pretty(&entry).map_err(|e| {
            audit_error("AUDIT_ENCODE_FAILED", "Failed to encode audit entry").with_details(e.to_string())
        })?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", entry.query_id, uuid::Uuid::new_v4()));
        fs::write(&tmp, &json).map_err(|e| {
            audit_error("AUDIT_WRITE_FAILED", "Failed to write audit entry")
                .with_details(format!("path={}; err={}", tmp.display(), e))
        })?;
        let linked = fs::hard_link(&tmp, &path);
        if let Err(e) = fs::remove_file(&tmp) {
            warn!(path = %tmp.display(), err = %e, "failed to remove audit temp file");
        }
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                return Err(audit_error("AUDIT_ENTRY_EXISTS", "Audit entry already exists")
                    .with_details(format!("query_id={}", entry.query_id)));
            }
            Err(e) => {
                return Err(audit_error("AUDIT_WRITE_FAILED", "Failed to publish audit entry")
                    .with_details(format!("path={}; err={}", path.display(), e)));
            }
        }

        info!(
            query_id = %entry.query_id,
            outcome = ?entry.outcome,
            citations = entry.citations.len(),
            degradations = entry.degradations.len(),
            "audit entry recorded"
        );
        Ok(entry)
    }

    pub fn load(&self, query_id: &str) -> Result<AuditLogEntry, AppError> {
        validate_query_id(query_id)?;
        let path = self.entry_path(query_id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(AppError::new(ErrorKind::NotFound, "AUDIT_NOT_FOUND", "No audit entry for query")
                    .with_details(format!("query_id={query_id}")));
            }
            Err(e) => {
                return Err(AppError::storage("AUDIT_READ_FAILED", "Failed to read audit entry")
                    .with_details(format!("path={}; err={}", path.display(), e)));
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            AppError::new(ErrorKind::Integrity, "AUDIT_ENTRY_CORRUPT", "Audit entry does not decode")
                .with_details(format!("path={}; err={}", path.display(), e))
        })
    }

    /// All entries, ordered by query id.
    pub fn list(&self) -> Result<Vec<AuditLogEntry>, AppError> {
        let mut ids: Vec<String> = fs::read_dir(&self.dir)
            .map_err(|e| {
                AppError::storage("AUDIT_READ_FAILED", "Failed to list audit entries")
                    .with_details(format!("path={}; err={}", self.dir.display(), e))
            })?
            .filter_map(|ent| ent.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string()))
            .filter(|id| !id.starts_with('.'))
            .collect();
        ids.sort();
        ids.iter().map(|id| self.load(id)).collect()
    }

    /// Recompute both hashes of a stored entry.
    pub fn verify(&self, query_id: &str) -> Result<AuditLogEntry, AppError> {
        let entry = self.load(query_id)?;
        let answer = sha256_hex(entry.answer_text.as_bytes());
        if answer != entry.answer_sha256 {
            return Err(AppError::new(
                ErrorKind::HashMismatch,
                "AUDIT_HASH_MISMATCH",
                "Audit answer hash does not match the answer text",
            )
            .with_details(format!("query_id={query_id}; field=answer_sha256")));
        }
        if entry.compute_entry_sha256()? != entry.entry_sha256 {
            return Err(AppError::new(
                ErrorKind::HashMismatch,
                "AUDIT_HASH_MISMATCH",
                "Audit entry hash does not match its content",
            )
            .with_details(format!("query_id={query_id}; field=entry_sha256")));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_ids_must_be_file_safe() {
        assert!(validate_query_id("q-1_a.b").is_ok());
        assert!(validate_query_id("").is_err());
        assert!(validate_query_id("../escape").is_err());
        assert!(validate_query_id(".hidden").is_err());
        assert!(validate_query_id("a/b").is_err());
    }
}
