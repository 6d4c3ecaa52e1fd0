use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{Entity, EntityRef};
use crate::error::AppError;
use crate::fsio::{ensure_dir, read_json_opt, remove_file_if_exists, write_json_atomic};

/// Write-ahead record of one commit. It is written before any primary record changes and
/// removed once the commit (records and indices) is fully applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub txn_id: String,
    pub deletes: Vec<EntityRef>,
    pub puts: Vec<Entity>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, txn_id: &str) -> PathBuf {
        self.dir.join(format!("{txn_id}.json"))
    }

    pub fn write(&self, entry: &JournalEntry) -> Result<(), AppError> {
        ensure_dir(&self.dir, "STORE_JOURNAL_WRITE_FAILED")?;
        write_json_atomic(&self.path(&entry.txn_id), entry, "STORE_JOURNAL_WRITE_FAILED")
    }

    pub fn clear(&self, txn_id: &str) -> Result<(), AppError> {
        remove_file_if_exists(&self.path(txn_id), "STORE_JOURNAL_CLEAR_FAILED")
    }

    /// Pending entries in commit order.
    pub fn pending(&self) -> Result<Vec<JournalEntry>, AppError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|e| {
                AppError::storage("STORE_JOURNAL_READ_FAILED", "Failed to list journal directory")
                    .with_details(format!("path={}; err={}", self.dir.display(), e))
            })?
            .filter_map(|ent| ent.ok().map(|e| e.path()))
            .filter(|p| is_json(p))
            .collect();
        paths.sort();

        let mut out = Vec::new();
        for p in paths {
            if let Some(entry) = read_json_opt::<JournalEntry>(&p, "STORE_JOURNAL_READ_FAILED")? {
                out.push(entry);
            }
        }
        Ok(out)
    }
}

fn is_json(p: &Path) -> bool {
    p.extension().and_then(|s| s.to_str()) == Some("json")
}
