//! Boundary normalization of meeting JSON.
//!
//! Two input shapes are accepted: the legacy flat shape (`id`, `date`, `participants`,
//! `transcript`, `decisions`, `tags`) and the structured workgroup shape (`workgroup_id`,
//! `meetingInfo`, `agendaItems`). Both resolve into one `NormalizedMeeting` before anything
//! touches the entity store.

pub mod names;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::domain::ValidationWarning;
use crate::error::AppError;
use crate::integrity::sha256_hex;

pub const LEGACY_WORKGROUP_ID: &str = "legacy";

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyMeeting {
    pub id: String,
    pub date: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Name lists show up both as JSON arrays and as comma-separated strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NameList {
    List(Vec<String>),
    Text(String),
}

impl NameList {
    pub fn names(&self) -> Vec<String> {
        match self {
            NameList::List(v) => v
                .iter()
                .flat_map(|s| names::split_names(s))
                .collect(),
            NameList::Text(s) => names::split_names(s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawWorkingDoc {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMeetingInfo {
    pub date: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub documenter: Option<String>,
    #[serde(default)]
    pub people_present: Option<NameList>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub working_docs: Vec<RawWorkingDoc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawActionItem {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDecisionItem {
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub effect: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAgendaItem {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub narrative: Option<String>,
    #[serde(default)]
    pub action_items: Vec<RawActionItem>,
    #[serde(default)]
    pub decision_items: Vec<RawDecisionItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredMeeting {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "workgroup_id")]
    pub workgroup_id: String,
    #[serde(default)]
    pub workgroup: Option<String>,
    pub meeting_info: RawMeetingInfo,
    #[serde(default)]
    pub agenda_items: Vec<RawAgendaItem>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The two accepted input forms, resolved at the boundary.
#[derive(Debug, Clone)]
pub enum RawMeeting {
    Legacy(LegacyMeeting),
    Structured(StructuredMeeting),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputForm {
    Legacy,
    Structured,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedDocument {
    pub id: String,
    pub title: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedDecision {
    pub id: String,
    pub decision: String,
    pub rationale: Option<String>,
    pub effect: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedAction {
    pub id: String,
    pub text: String,
    pub assignee: Option<String>,
    pub due_date: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedAgendaItem {
    pub id: String,
    pub status: Option<String>,
    pub narrative: Option<String>,
    pub decisions: Vec<NormalizedDecision>,
    pub actions: Vec<NormalizedAction>,
}

/// Single internal shape for both input forms. People are still names here; the ingestor
/// resolves them to person ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedMeeting {
    pub form: InputForm,
    pub meeting_id: String,
    pub workgroup_id: String,
    pub workgroup_name: String,
    pub date: String,
    pub host: Option<String>,
    pub documenter: Option<String>,
    pub attendees: Vec<String>,
    pub purpose: Option<String>,
    pub tags: Vec<String>,
    pub documents: Vec<NormalizedDocument>,
    pub agenda_items: Vec<NormalizedAgendaItem>,
    pub body_text: String,
    pub source_sha256: String,
    pub warnings: Vec<ValidationWarning>,
}

/// Detect the input form of a decoded JSON value.
pub fn parse_raw_meeting(value: serde_json::Value) -> Result<RawMeeting, AppError> {
    let obj = value.as_object().ok_or_else(|| {
        AppError::malformed("INGEST_NOT_AN_OBJECT", "Meeting record must be a JSON object")
    })?;

    if obj.contains_key("meetingInfo") || obj.contains_key("workgroup_id") {
        let m: StructuredMeeting = serde_json::from_value(value).map_err(|e| {
            AppError::malformed(
                "INGEST_STRUCTURED_INVALID",
                "Structured meeting record is missing required fields",
            )
            .with_details(e.to_string())
        })?;
        return Ok(RawMeeting::Structured(m));
    }

    if obj.contains_key("id") && obj.contains_key("date") {
        let m: LegacyMeeting = serde_json::from_value(value).map_err(|e| {
            AppError::malformed(
                "INGEST_LEGACY_INVALID",
                "Legacy meeting record has invalid fields",
            )
            .with_details(e.to_string())
        })?;
        return Ok(RawMeeting::Legacy(m));
    }

    Err(AppError::malformed(
        "INGEST_SHAPE_UNKNOWN",
        "Record matches neither the legacy nor the structured meeting shape",
    )
    .with_details(format!(
        "keys={}",
        obj.keys().cloned().collect::<Vec<_>>().join(",")
    )))
}

pub fn parse_meeting_json(text: &str) -> Result<RawMeeting, AppError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        AppError::malformed("INGEST_JSON_PARSE_FAILED", "Failed to parse meeting JSON")
            .with_details(e.to_string())
    })?;
    parse_raw_meeting(value)
}

/// Canonicalize a meeting date to `YYYY-MM-DD`. RFC3339 timestamps keep their date part.
pub fn canonical_date(raw: &str) -> Result<String, AppError> {
    let fmt = format_description!("[year]-[month]-[day]");
    let t = raw.trim();
    if t.is_empty() {
        return Err(AppError::malformed("INGEST_DATE_MISSING", "Meeting date is required"));
    }
    if let Ok(d) = Date::parse(t, &fmt) {
        return d.format(&fmt).map_err(|e| {
            AppError::malformed("INGEST_DATE_INVALID", "Failed to format meeting date")
                .with_details(e.to_string())
        });
    }
    if let Ok(dt) = OffsetDateTime::parse(t, &Rfc3339) {
        return dt.date().format(&fmt).map_err(|e| {
            AppError::malformed("INGEST_DATE_INVALID", "Failed to format meeting date")
                .with_details(e.to_string())
        });
    }
    Err(AppError::malformed(
        "INGEST_DATE_INVALID",
        "Meeting date must be YYYY-MM-DD or RFC3339",
    )
    .with_details(format!("value={t}")))
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn validate_id(field: &str, id: &str) -> Result<String, AppError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(AppError::malformed("INGEST_ID_MISSING", "Record id must not be empty")
            .with_details(format!("field={field}")));
    }
    // Ids become file names in the entity store.
    if id
        .chars()
        .any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
        || id == "."
        || id == ".."
    {
        return Err(AppError::malformed(
            "INGEST_ID_INVALID",
            "Record id contains characters that cannot be stored",
        )
        .with_details(format!("field={field}; id={id}")));
    }
    Ok(id.to_string())
}

pub fn normalize(raw: RawMeeting) -> Result<NormalizedMeeting, AppError> {
    match raw {
        RawMeeting::Legacy(m) => normalize_legacy(m),
        RawMeeting::Structured(m) => normalize_structured(m),
    }
}

fn normalize_legacy(m: LegacyMeeting) -> Result<NormalizedMeeting, AppError> {
    let meeting_id = validate_id("id", &m.id)?;
    let date = canonical_date(&m.date)?;
    let transcript = non_empty(m.transcript.as_ref());
    let decisions: Vec<String> = m
        .decisions
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .map(|d| d.to_string())
        .collect();
    if transcript.is_none() && decisions.is_empty() {
        return Err(AppError::malformed(
            "INGEST_CONTENT_MISSING",
            "Legacy meeting has neither transcript nor decisions",
        )
        .with_details(format!("id={meeting_id}")));
    }

    let attendees: Vec<String> = m
        .participants
        .iter()
        .flat_map(|p| names::split_names(p))
        .collect();
    let host = attendees.first().cloned();

    let mut agenda_items = Vec::new();
    if !decisions.is_empty() {
        let agenda_id = format!("{meeting_id}-agenda-0");
        agenda_items.push(NormalizedAgendaItem {
            id: agenda_id.clone(),
            status: None,
            narrative: None,
            decisions: decisions
                .iter()
                .enumerate()
                .map(|(i, d)| NormalizedDecision {
                    id: format!("{agenda_id}-decision-{i}"),
                    decision: d.clone(),
                    rationale: None,
                    effect: None,
                })
                .collect(),
            actions: Vec::new(),
        });
    }

    let mut warnings = Vec::new();
    if host.is_none() {
        warnings.push(
            ValidationWarning::new(
                "NORMALIZE_NO_PARTICIPANTS",
                "Legacy meeting lists no participants; citations cannot fall back to a host",
            )
            .with_details(format!("id={meeting_id}")),
        );
    }

    let mut tags: Vec<String> = m.tags.iter().map(|t| t.trim().to_string()).collect();
    tags.retain(|t| !t.is_empty());

    let mut out = NormalizedMeeting {
        form: InputForm::Legacy,
        meeting_id,
        workgroup_id: LEGACY_WORKGROUP_ID.to_string(),
        workgroup_name: "Legacy archive".to_string(),
        date,
        host,
        documenter: None,
        attendees,
        purpose: None,
        tags,
        documents: Vec::new(),
        agenda_items,
        body_text: String::new(),
        source_sha256: String::new(),
        warnings,
    };
    finish_body(&mut out, transcript.as_deref());
    Ok(out)
}

fn normalize_structured(m: StructuredMeeting) -> Result<NormalizedMeeting, AppError> {
    let workgroup_id = validate_id("workgroup_id", &m.workgroup_id)?;
    let date = canonical_date(&m.meeting_info.date)?;
    let meeting_id = match m.id.as_ref() {
        Some(id) => validate_id("id", id)?,
        None => validate_id("id", &format!("{workgroup_id}-{date}"))?,
    };
    let info = &m.meeting_info;

    let attendees = info
        .people_present
        .as_ref()
        .map(|p| p.names())
        .unwrap_or_default();

    let documents = info
        .working_docs
        .iter()
        .enumerate()
        .filter_map(|(i, d)| {
            let title = non_empty(d.title.as_ref()).or_else(|| non_empty(d.link.as_ref()))?;
            Some(NormalizedDocument {
                id: format!("{meeting_id}-doc-{i}"),
                title,
                link: non_empty(d.link.as_ref()),
            })
        })
        .collect();

    let mut warnings = Vec::new();
    let mut agenda_items = Vec::new();
    for (ai, item) in m.agenda_items.iter().enumerate() {
        let agenda_id = format!("{meeting_id}-agenda-{ai}");
        let mut decisions = Vec::new();
        for (di, d) in item.decision_items.iter().enumerate() {
            let Some(decision) = non_empty(d.decision.as_ref()) else {
                warnings.push(
                    ValidationWarning::new(
                        "NORMALIZE_DECISION_EMPTY",
                        "Skipped decision item without decision text",
                    )
                    .with_details(format!("agenda_item={agenda_id}; index={di}")),
                );
                continue;
            };
            decisions.push(NormalizedDecision {
                id: format!("{agenda_id}-decision-{di}"),
                decision,
                rationale: non_empty(d.rationale.as_ref()),
                effect: non_empty(d.effect.as_ref()),
            });
        }
        let mut actions = Vec::new();
        for (xi, a) in item.action_items.iter().enumerate() {
            let Some(text) = non_empty(a.text.as_ref()) else {
                warnings.push(
                    ValidationWarning::new(
                        "NORMALIZE_ACTION_EMPTY",
                        "Skipped action item without text",
                    )
                    .with_details(format!("agenda_item={agenda_id}; index={xi}")),
                );
                continue;
            };
            actions.push(NormalizedAction {
                id: format!("{agenda_id}-action-{xi}"),
                text,
                assignee: non_empty(a.assignee.as_ref()),
                due_date: non_empty(a.due_date.as_ref()),
                status: non_empty(a.status.as_ref()),
            });
        }
        agenda_items.push(NormalizedAgendaItem {
            id: agenda_id,
            status: non_empty(item.status.as_ref()),
            narrative: non_empty(item.narrative.as_ref()),
            decisions,
            actions,
        });
    }

    let mut tags: Vec<String> = m.tags.iter().map(|t| t.trim().to_string()).collect();
    tags.retain(|t| !t.is_empty());

    let mut out = NormalizedMeeting {
        form: InputForm::Structured,
        meeting_id,
        workgroup_name: non_empty(m.workgroup.as_ref()).unwrap_or_else(|| workgroup_id.clone()),
        workgroup_id,
        date,
        host: non_empty(info.host.as_ref()),
        documenter: non_empty(info.documenter.as_ref()),
        attendees,
        purpose: non_empty(info.purpose.as_ref()),
        tags,
        documents,
        agenda_items,
        body_text: String::new(),
        source_sha256: String::new(),
        warnings,
    };
    finish_body(&mut out, None);
    Ok(out)
}

/// Compose the canonical indexed text and its hash. Transcript lines keep their
/// `Speaker: text` form so the chunker can attribute windows.
fn finish_body(m: &mut NormalizedMeeting, transcript: Option<&str>) {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!(
        "Meeting {} on {} ({})",
        m.meeting_id, m.date, m.workgroup_name
    ));
    if let Some(p) = m.purpose.as_ref() {
        lines.push(format!("Purpose: {p}"));
    }
    if let Some(t) = transcript {
        lines.push(String::new());
        for l in t.replace("\r\n", "\n").replace('\r', "\n").lines() {
            lines.push(l.trim_end().to_string());
        }
    }

    let legacy = m.form == InputForm::Legacy;
    for (i, item) in m.agenda_items.iter().enumerate() {
        lines.push(String::new());
        if legacy {
            lines.push("Decisions:".to_string());
        } else {
            let status = item.status.as_deref().unwrap_or("unknown");
            lines.push(format!("Agenda item {} [{}]", i + 1, status));
            if let Some(n) = item.narrative.as_ref() {
                lines.push(n.clone());
            }
        }
        for d in item.decisions.iter() {
            let mut line = format!("- Decision: {}", d.decision);
            if let Some(r) = d.rationale.as_ref() {
                line.push_str(&format!(" Rationale: {r}"));
            }
            if let Some(e) = d.effect.as_ref() {
                line.push_str(&format!(" Effect: {e}"));
            }
            lines.push(line);
        }
        for a in item.actions.iter() {
            let mut line = format!("- Action: {}", a.text);
            if let Some(who) = a.assignee.as_ref() {
                line.push_str(&format!(" (assignee: {who})"));
            }
            if let Some(due) = a.due_date.as_ref() {
                line.push_str(&format!(" (due: {due})"));
            }
            if let Some(s) = a.status.as_ref() {
                line.push_str(&format!(" (status: {s})"));
            }
            lines.push(line);
        }
    }

    if !m.documents.is_empty() {
        lines.push(String::new());
        lines.push("Working documents:".to_string());
        for d in m.documents.iter() {
            match d.link.as_ref() {
                Some(l) => lines.push(format!("- {} <{}>", d.title, l)),
                None => lines.push(format!("- {}", d.title)),
            }
        }
    }

    m.body_text = lines.join("\n");
    m.source_sha256 = sha256_hex(m.body_text.as_bytes());
}
