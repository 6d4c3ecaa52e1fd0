use std::collections::BTreeMap;

use marc_core::error::{AppError, ErrorKind};

const MARKER_OPEN: &str = "[[chunk:";
const MARKER_CLOSE: &str = "]]";

/// Enforce that model output cites archived chunks.
///
/// Expected citation format: `[[chunk:<id>]]` anywhere in the output.
pub fn enforce_citations(output: &str) -> Result<(), AppError> {
    if extract_cited_chunk_ids(output).is_empty() {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            "AI_CITATION_REQUIRED",
            "Answer must include archive chunk citations",
        ));
    }
    Ok(())
}

/// Marker positions as `(start, end, chunk_id)`; `end` is exclusive.
fn markers(output: &str) -> Vec<(usize, usize, &str)> {
    let mut out = Vec::new();
    let mut from = 0usize;
    while let Some(rel) = output[from..].find(MARKER_OPEN) {
        let start = from + rel;
        let id_start = start + MARKER_OPEN.len();
        let Some(close) = output[id_start..].find(MARKER_CLOSE) else {
            break;
        };
        let id = output[id_start..id_start + close].trim();
        let end = id_start + close + MARKER_CLOSE.len();
        if !id.is_empty() && !id.contains('[') {
            out.push((start, end, id));
            from = end;
        } else {
            from = id_start;
        }
    }
    out
}

/// Cited chunk ids in first-appearance order, without duplicates.
pub fn extract_cited_chunk_ids(output: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for (_, _, id) in markers(output) {
        if !out.iter().any(|x| x == id) {
            out.push(id.to_string());
        }
    }
    out
}

pub fn ensure_citations_allowed(cited: &[String], allowed: &[String]) -> Result<(), AppError> {
    for cid in cited {
        if !allowed.contains(cid) {
            return Err(AppError::new(
                ErrorKind::InvalidInput,
                "AI_CITATION_INVALID",
                "Answer cited a chunk outside the retrieved context",
            )
            .with_details(format!("chunk_id={cid}")));
        }
    }
    Ok(())
}

/// Replace each `[[chunk:<id>]]` with its rendered citation. Unknown ids are left as-is.
pub fn rewrite_markers(output: &str, rendered: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(output.len());
    let mut last = 0usize;
    for (start, end, id) in markers(output) {
        if let Some(r) = rendered.get(id) {
            out.push_str(&output[last..start]);
            out.push_str(r);
            last = end;
        }
    }
    out.push_str(&output[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_keep_first_appearance_order() {
        let text = "b [[chunk:m2:0]] a [[chunk:m1:0]] again [[chunk:m2:0]] [[chunk:]]";
        assert_eq!(extract_cited_chunk_ids(text), vec!["m2:0".to_string(), "m1:0".to_string()]);
    }

    #[test]
    fn only_context_chunks_are_allowed() {
        let allowed = vec!["m1:0".to_string()];
        assert!(ensure_citations_allowed(&["m1:0".to_string()], &allowed).is_ok());
        let err = ensure_citations_allowed(&["m9:0".to_string()], &allowed).unwrap_err();
        assert_eq!(err.code, "AI_CITATION_INVALID");
    }

    #[test]
    fn markers_become_citation_strings() {
        let mut map = BTreeMap::new();
        map.insert("m1:0".to_string(), "[m1 | 2024-03-15 | Bob Smith]".to_string());
        assert_eq!(
            rewrite_markers("Budget approved [[chunk:m1:0]].", &map),
            "Budget approved [m1 | 2024-03-15 | Bob Smith]."
        );
    }
}
