//! Fixed-size overlapping windows over meeting body text.
//!
//! Offsets are byte offsets into the source string. Window edges are snapped to UTF-8
//! character boundaries: the end moves back, the start moves forward.

use marc_core::error::{AppError, ErrorKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextChunk {
    pub offset: usize,
    pub text: String,
}

fn floor_boundary(text: &str, mut i: usize) -> usize {
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(text: &str, mut i: usize) -> usize {
    while i < text.len() && !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<TextChunk>, AppError> {
    if size == 0 {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            "CHUNK_SIZE_INVALID",
            "Chunk size must be greater than zero",
        ));
    }
    if overlap >= size {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            "CHUNK_OVERLAP_INVALID",
            "Chunk overlap must be smaller than chunk size",
        )
        .with_details(format!("size={size}; overlap={overlap}")));
    }

    let mut out = Vec::new();
    let mut start = 0usize;
    while start < text.len() {
        let mut end = floor_boundary(text, (start + size).min(text.len()));
        if end <= start {
            // Window narrower than one character.
            end = ceil_boundary(text, start + 1);
        }
        out.push(TextChunk {
            offset: start,
            text: text[start..end].to_string(),
        });
        if end == text.len() {
            break;
        }
        let next = ceil_boundary(text, end.saturating_sub(overlap));
        start = if next > start { next } else { end };
    }
    Ok(out)
}

/// Labels the meeting body uses for its own sections; never speakers.
const SECTION_LABELS: &[&str] = &[
    "action",
    "agenda item",
    "decision",
    "decisions",
    "effect",
    "note",
    "notes",
    "purpose",
    "rationale",
    "working documents",
];

const MAX_SPEAKER_WORDS: usize = 4;

/// Whether `label` in a `label: text` line reads as a person's name.
fn is_speaker_label(label: &str, known_names: &[String]) -> bool {
    if known_names.iter().any(|n| n.eq_ignore_ascii_case(label)) {
        return true;
    }
    if SECTION_LABELS.iter().any(|h| h.eq_ignore_ascii_case(label)) {
        return false;
    }
    let words: Vec<&str> = label.split_whitespace().collect();
    !words.is_empty()
        && words.len() <= MAX_SPEAKER_WORDS
        && words.iter().all(|w| {
            w.chars().next().is_some_and(char::is_uppercase)
                && w.chars().all(|c| c.is_alphabetic() || matches!(c, '.' | '-' | '\''))
        })
}

/// Speaker of a chunk: its `Name: text` lines must all carry the same label and that label
/// must be a known person. Any second speaker, known or not, leaves the chunk unattributed.
pub fn attribute_speaker(text: &str, known_names: &[String]) -> Option<String> {
    let mut found: Option<&str> = None;
    for line in text.lines() {
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        if rest.trim().is_empty() {
            continue;
        }
        let label = label.trim();
        if !is_speaker_label(label, known_names) {
            continue;
        }
        match found {
            None => found = Some(label),
            Some(prev) if prev.eq_ignore_ascii_case(label) => {}
            Some(_) => return None,
        }
    }
    let label = found?;
    known_names
        .iter()
        .find(|n| n.eq_ignore_ascii_case(label))
        .cloned()
}
