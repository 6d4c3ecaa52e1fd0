use sha2::{Digest, Sha256};

use crate::error::AppError;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json_string(v: &serde_json::Value) -> Result<String, AppError> {
    serde_json::to_string(&canonicalize_json_value(v)).map_err(|e| {
        AppError::storage("CANONICAL_JSON_FAILED", "Failed to canonicalize JSON")
            .with_details(e.to_string())
    })
}

fn canonicalize_json_value(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize_json_value(&map[k]));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(canonicalize_json_value).collect())
        }
        _ => v.clone(),
    }
}
