//! Small file helpers shared by the on-disk stores.
//!
//! Every persisted JSON document goes through `write_json_atomic`: the bytes land in a
//! sibling `.tmp` file first and are renamed over the destination, so a reader never
//! observes a half-written record.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::AppError;

pub fn ensure_dir(path: &Path, code: &str) -> Result<(), AppError> {
    fs::create_dir_all(path).map_err(|e| {
        AppError::storage(code, "Failed to create directory")
            .with_details(format!("path={}; err={}", path.display(), e))
    })
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8], code: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent, code)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| {
        AppError::storage(code, "Failed to write file")
            .with_details(format!("path={}; err={}", tmp.display(), e))
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        AppError::storage(code, "Failed to finalize file write")
            .with_details(format!("tmp={}; dest={}; err={}", tmp.display(), path.display(), e))
    })
}

pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    code: &str,
) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| {
        AppError::storage(code, "Failed to encode JSON").with_details(e.to_string())
    })?;
    write_bytes_atomic(path, json.as_bytes(), code)
}

/// Read and decode a JSON document; a missing file yields `None`.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path, code: &str) -> Result<Option<T>, AppError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(|e| {
        AppError::storage(code, "Failed to read file")
            .with_details(format!("path={}; err={}", path.display(), e))
    })?;
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        AppError::storage(code, "Failed to decode JSON")
            .with_details(format!("path={}; err={}", path.display(), e))
    })
}

pub fn remove_file_if_exists(path: &Path, code: &str) -> Result<(), AppError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AppError::storage(code, "Failed to delete file")
            .with_details(format!("path={}; err={}", path.display(), e))),
    }
}
