//! Citations: `[meeting_id | date | speaker]`, joined from the sidecar and the entity store.

use marc_core::domain::{Meeting, Person};
use marc_core::error::{AppError, ErrorKind};
use marc_core::store::EntityStore;
use serde::{Deserialize, Serialize};

use crate::index::IndexSnapshot;

pub const CITATION_FORMAT_VERSION: u32 = 1;

const EXCERPT_MAX_CHARS: usize = 200;
const INFERRED_SUFFIX: &str = " (inferred)";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    /// The chunk's own transcript names the speaker.
    Direct,
    InferredHost,
    InferredDocumenter,
    Unknown,
}

impl Attribution {
    pub fn is_inferred(&self) -> bool {
        !matches!(self, Attribution::Direct)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub meeting_id: String,
    pub date: String,
    pub speaker: Option<String>,
    pub attribution: Attribution,
    pub excerpt: String,
    pub chunk_id: String,
    pub offset: usize,
}

impl Citation {
    pub fn render(&self) -> String {
        let who = self.speaker.as_deref().unwrap_or("unknown");
        let suffix = if self.attribution.is_inferred() { INFERRED_SUFFIX } else { "" };
        format!("[{} | {} | {who}{suffix}]", self.meeting_id, self.date)
    }
}

/// Fields recovered from a rendered citation string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCitation {
    pub meeting_id: String,
    pub date: String,
    pub speaker: Option<String>,
    pub inferred: bool,
}

pub fn parse_citation(s: &str) -> Result<ParsedCitation, AppError> {
    let bad = || {
        AppError::malformed("CITATION_PARSE_FAILED", "Not a citation string")
            .with_details(format!("value={s}"))
    };
    let inner = s
        .trim()
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .ok_or_else(bad)?;
    let parts: Vec<&str> = inner.split(" | ").collect();
    let [meeting_id, date, who] = parts.as_slice() else {
        return Err(bad());
    };
    if meeting_id.is_empty() || date.is_empty() || who.is_empty() {
        return Err(bad());
    }
    let (name, inferred) = match who.strip_suffix(INFERRED_SUFFIX) {
        Some(n) => (n, true),
        None => (*who, false),
    };
    Ok(ParsedCitation {
        meeting_id: meeting_id.to_string(),
        date: date.to_string(),
        speaker: if inferred && name == "unknown" {
            None
        } else {
            Some(name.to_string())
        },
        inferred,
    })
}

fn excerpt(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= EXCERPT_MAX_CHARS {
        return collapsed;
    }
    let mut s: String = collapsed.chars().take(EXCERPT_MAX_CHARS).collect();
    s.push_str("...");
    s
}

fn integrity(code: &str, message: &str, details: String) -> AppError {
    AppError::new(ErrorKind::Integrity, code, message).with_details(details)
}

pub struct CitationExtractor<'a> {
    store: &'a EntityStore,
    snapshot: &'a IndexSnapshot,
}

impl<'a> CitationExtractor<'a> {
    pub fn new(store: &'a EntityStore, snapshot: &'a IndexSnapshot) -> Self {
        Self { store, snapshot }
    }

    pub fn extract(&self, chunk_id: &str) -> Result<Citation, AppError> {
        let entry = self.snapshot.entry(chunk_id).ok_or_else(|| {
            AppError::new(ErrorKind::NotFound, "CITATION_CHUNK_UNKNOWN", "Chunk is not in the index")
                .with_details(format!("chunk_id={chunk_id}"))
        })?;
        if entry.meeting_id.trim().is_empty() {
            return Err(integrity(
                "CITATION_MEETING_MISSING",
                "Chunk has no meeting id",
                format!("chunk_id={chunk_id}"),
            ));
        }
        if entry.date.trim().is_empty() {
            return Err(integrity(
                "CITATION_DATE_MISSING",
                "Chunk has no meeting date",
                format!("chunk_id={chunk_id}"),
            ));
        }
        let meeting: Meeting = self.store.load(&entry.meeting_id).map_err(|e| {
            if e.is(ErrorKind::NotFound) {
                integrity(
                    "CITATION_MEETING_MISSING",
                    "Cited meeting is not in the store",
                    format!("chunk_id={chunk_id}; meeting_id={}", entry.meeting_id),
                )
            } else {
                e
            }
        })?;
        if meeting.date.trim().is_empty() {
            return Err(integrity(
                "CITATION_DATE_MISSING",
                "Cited meeting has no date",
                format!("meeting_id={}", meeting.id),
            ));
        }
        if meeting.date != entry.date {
            return Err(integrity(
                "CITATION_DATE_MISMATCH",
                "Index date differs from the stored meeting",
                format!(
                    "meeting_id={}; index_date={}; store_date={}",
                    meeting.id, entry.date, meeting.date
                ),
            ));
        }

        let (speaker, attribution) = match entry.speaker.as_ref() {
            Some(s) => (Some(s.clone()), Attribution::Direct),
            None => self.fallback_speaker(&meeting)?,
        };
        Ok(Citation {
            meeting_id: meeting.id,
            date: meeting.date,
            speaker,
            attribution,
            excerpt: excerpt(&entry.text),
            chunk_id: entry.chunk_id.clone(),
            offset: entry.offset,
        })
    }

    fn fallback_speaker(&self, m: &Meeting) -> Result<(Option<String>, Attribution), AppError> {
        if let Some(id) = m.host_id.as_ref() {
            let p: Person = self.store.load(id)?;
            return Ok((Some(p.display_name), Attribution::InferredHost));
        }
        if let Some(id) = m.documenter_id.as_ref() {
            let p: Person = self.store.load(id)?;
            return Ok((Some(p.display_name), Attribution::InferredDocumenter));
        }
        Ok((None, Attribution::Unknown))
    }
}

/// Every citation must point at a stored meeting with the same date.
pub fn validate_citations(store: &EntityStore, citations: &[Citation]) -> Result<(), AppError> {
    for c in citations {
        let meeting: Meeting = store.load(&c.meeting_id).map_err(|e| {
            if e.is(ErrorKind::NotFound) {
                integrity(
                    "CITATION_MEETING_MISSING",
                    "Citation refers to a missing meeting",
                    format!("citation={}", c.render()),
                )
            } else {
                e
            }
        })?;
        if meeting.date != c.date {
            return Err(integrity(
                "CITATION_DATE_MISMATCH",
                "Citation date differs from the stored meeting",
                format!("citation={}; store_date={}", c.render(), meeting.date),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cite(speaker: Option<&str>, attribution: Attribution) -> Citation {
        Citation {
            meeting_id: "m1".to_string(),
            date: "2024-03-15".to_string(),
            speaker: speaker.map(str::to_string),
            attribution,
            excerpt: String::new(),
            chunk_id: "m1:0".to_string(),
            offset: 0,
        }
    }

    #[test]
    fn renders_each_attribution() {
        assert_eq!(
            cite(Some("Bob Smith"), Attribution::Direct).render(),
            "[m1 | 2024-03-15 | Bob Smith]"
        );
        assert_eq!(
            cite(Some("Alice Nguyen"), Attribution::InferredHost).render(),
            "[m1 | 2024-03-15 | Alice Nguyen (inferred)]"
        );
        assert_eq!(
            cite(None, Attribution::Unknown).render(),
            "[m1 | 2024-03-15 | unknown (inferred)]"
        );
    }

    #[test]
    fn parse_reads_back_rendered_strings() {
        let p = parse_citation("[m1 | 2024-03-15 | Alice Nguyen (inferred)]").unwrap();
        assert_eq!(p.speaker.as_deref(), Some("Alice Nguyen"));
        assert!(p.inferred);
        let p = parse_citation("[m1 | 2024-03-15 | unknown (inferred)]").unwrap();
        assert_eq!(p.speaker, None);
        assert!(parse_citation("[m1 | 2024-03-15]").is_err());
        assert!(parse_citation("m1 | 2024-03-15 | x").is_err());
    }

    #[test]
    fn excerpt_is_single_line_and_bounded() {
        let long = "word ".repeat(100);
        let e = excerpt(&format!("a\n\nb  c\n{long}"));
        assert!(e.starts_with("a b c word"));
        assert!(e.ends_with("..."));
        assert_eq!(e.chars().count(), EXCERPT_MAX_CHARS + 3);
    }
}
