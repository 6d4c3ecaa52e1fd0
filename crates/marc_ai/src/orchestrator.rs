//! Per-query pipeline:
//! `Received -> Embedding -> Retrieving -> (NoEvidence | ContextAssembled) -> Generating ->
//! Citing -> Audited -> Responded`, with `Failed` for unrecoverable errors.
//!
//! A generator failure moves the query back to `ContextAssembled` and the next generator
//! in the chain is tried; each skipped provider becomes a `Degradation` in the audit entry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use marc_core::config::Settings;
use marc_core::error::{AppError, ErrorKind};
use marc_core::store::EntityStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::answer::{ContextChunk, GenerationChain};
use crate::audit::{AuditLog, AuditLogEntry, AuditRecordInput};
use crate::citation::{validate_citations, Citation, CitationExtractor};
use crate::embeddings::EmbeddingChain;
use crate::guardrails::rewrite_markers;
use crate::index::IndexSnapshot;
use crate::providers::{Degradation, Stage};
use crate::retrieve::search;

pub use crate::audit::QueryOutcome;

pub const NO_EVIDENCE_MESSAGE: &str = "no relevant archive data found";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Received,
    Embedding,
    Retrieving,
    NoEvidence,
    ContextAssembled,
    Generating,
    Citing,
    Audited,
    Responded,
    Failed,
}

/// Shared cancel flag, checked before every blocking step and before the audit write.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    pub query_id: Option<String>,
    pub text: String,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            query_id: None,
            text: text.into(),
        }
    }

    pub fn with_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryResponse {
    pub query_id: String,
    pub outcome: QueryOutcome,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub rendered_citations: Vec<String>,
    pub generator: Option<String>,
    pub transitions: Vec<QueryState>,
    pub degradations: Vec<Degradation>,
    pub audit: AuditLogEntry,
}

struct Trace {
    query_id: String,
    states: Vec<QueryState>,
}

impl Trace {
    fn enter(&mut self, state: QueryState) {
        debug!(query_id = %self.query_id, state = ?state, "query state");
        self.states.push(state);
    }

    /// Terminal failure. The transition path is appended to the error details.
    fn fail(&mut self, mut err: AppError) -> AppError {
        self.enter(QueryState::Failed);
        warn!(query_id = %self.query_id, kind = %err.kind, code = %err.code, "query failed");
        let path = self
            .states
            .iter()
            .map(|s| format!("{s:?}"))
            .collect::<Vec<_>>()
            .join(">");
        err.details = Some(match err.details.take() {
            Some(d) => format!("{d}; trace={path}"),
            None => format!("trace={path}"),
        });
        err
    }

    fn checkpoint(&mut self, cancel: &CancellationToken, at: QueryState) -> Result<(), AppError> {
        check_cancel(cancel, at).map_err(|e| self.fail(e))
    }
}

fn check_cancel(cancel: &CancellationToken, at: QueryState) -> Result<(), AppError> {
    if cancel.is_cancelled() {
        return Err(AppError::new(ErrorKind::Cancelled, "QUERY_CANCELLED", "Query was cancelled")
            .with_details(format!("state={at:?}")));
    }
    Ok(())
}

pub struct QueryOrchestrator<'a> {
    settings: &'a Settings,
    store: &'a EntityStore,
    snapshot: &'a IndexSnapshot,
    embeddings: &'a EmbeddingChain,
    generation: &'a GenerationChain,
    audit: &'a AuditLog,
}

impl<'a> QueryOrchestrator<'a> {
    pub fn new(
        settings: &'a Settings,
        store: &'a EntityStore,
        snapshot: &'a IndexSnapshot,
        embeddings: &'a EmbeddingChain,
        generation: &'a GenerationChain,
        audit: &'a AuditLog,
    ) -> Self {
        Self {
            settings,
            store,
            snapshot,
            embeddings,
            generation,
            audit,
        }
    }

    pub fn run(&self, req: QueryRequest, cancel: &CancellationToken) -> Result<QueryResponse, AppError> {
        let text = req.text.trim().to_string();
        if text.is_empty() {
            return Err(AppError::malformed("QUERY_EMPTY", "Query text must not be empty"));
        }
        let query_id = req
            .query_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut trace = Trace {
            query_id: query_id.clone(),
            states: Vec::new(),
        };
        trace.enter(QueryState::Received);
        let mut degradations: Vec<Degradation> = Vec::new();

        // Embedding
        trace.checkpoint(cancel, QueryState::Embedding)?;
        trace.enter(QueryState::Embedding);
        let embedded = self
            .embeddings
            .embed(Some(self.snapshot.model()), &text)
            .map_err(|e| trace.fail(e))?;
        for d in embedded.degradations.iter() {
            warn!(query_id = %query_id, provider = %d.provider, code = %d.code, "embedding degraded");
        }
        degradations.extend(embedded.degradations);

        // Retrieving
        trace.checkpoint(cancel, QueryState::Retrieving)?;
        trace.enter(QueryState::Retrieving);
        let hits = search(
            self.snapshot,
            &embedded.vector,
            self.settings.retrieval.top_k,
            self.settings.retrieval.min_score,
        )
        .map_err(|e| trace.fail(e))?;

        if hits.is_empty() {
            trace.enter(QueryState::NoEvidence);
            trace.checkpoint(cancel, QueryState::Audited)?;
            let audit = self
                .audit
                .record(AuditRecordInput {
                    query_id: query_id.clone(),
                    query_text: text.clone(),
                    answer_text: NO_EVIDENCE_MESSAGE.to_string(),
                    citations: Vec::new(),
                    outcome: QueryOutcome::NoEvidence,
                    generator: None,
                    model_version: "none".to_string(),
                    embedding_version: embedded.model.clone(),
                    index_generation: self.snapshot.generation().to_string(),
                    degradations: degradations.clone(),
                })
                .map_err(|e| trace.fail(e))?;
            trace.enter(QueryState::Audited);
            trace.enter(QueryState::Responded);
            info!(query_id = %query_id, outcome = "no_evidence", "query answered");
            return Ok(QueryResponse {
                query_id,
                outcome: QueryOutcome::NoEvidence,
                answer: NO_EVIDENCE_MESSAGE.to_string(),
                citations: Vec::new(),
                rendered_citations: Vec::new(),
                generator: None,
                transitions: trace.states,
                degradations,
                audit,
            });
        }

        let extractor = CitationExtractor::new(self.store, self.snapshot);
        let mut by_chunk: BTreeMap<String, Citation> = BTreeMap::new();
        let mut context: Vec<ContextChunk> = Vec::new();
        for hit in hits.iter() {
            let citation = extractor.extract(&hit.chunk_id).map_err(|e| trace.fail(e))?;
            let text = self
                .snapshot
                .entry(&hit.chunk_id)
                .map(|e| e.text.clone())
                .unwrap_or_default();
            context.push(ContextChunk {
                chunk_id: hit.chunk_id.clone(),
                meeting_id: citation.meeting_id.clone(),
                date: citation.date.clone(),
                citation: citation.render(),
                score: hit.score,
                text,
            });
            by_chunk.insert(hit.chunk_id.clone(), citation);
        }
        trace.enter(QueryState::ContextAssembled);

        let mut generated = None;
        for g in self.generation.generators() {
            trace.checkpoint(cancel, QueryState::Generating)?;
            trace.enter(QueryState::Generating);
            match g.generate(&text, &context) {
                Ok(a) => {
                    generated = Some(a);
                    break;
                }
                Err(e) => {
                    warn!(query_id = %query_id, generator = %g.name(), code = %e.code, "generator failed; falling back");
                    degradations.push(Degradation::from_error(Stage::Generation, g.name(), &e));
                    trace.enter(QueryState::ContextAssembled);
                }
            }
        }
        let Some(answer) = generated else {
            return Err(trace.fail(
                AppError::new(
                    ErrorKind::ProviderUnavailable,
                    "AI_GENERATION_UNAVAILABLE",
                    "No answer generator succeeded",
                )
                .with_details(format!("tried={}", self.generation.generator_names().join(","))),
            ));
        };

        trace.checkpoint(cancel, QueryState::Citing)?;
        trace.enter(QueryState::Citing);
        let mut citations: Vec<Citation> = Vec::new();
        for cid in answer.cited_chunk_ids.iter() {
            let c = by_chunk.get(cid).cloned().ok_or_else(|| {
                trace.fail(
                    AppError::new(
                        ErrorKind::Integrity,
                        "AI_CITATION_INVALID",
                        "Answer cited a chunk outside the retrieved context",
                    )
                    .with_details(format!("chunk_id={cid}")),
                )
            })?;
            citations.push(c);
        }
        validate_citations(self.store, &citations).map_err(|e| trace.fail(e))?;
        let rendered_map: BTreeMap<String, String> = citations
            .iter()
            .map(|c| (c.chunk_id.clone(), c.render()))
            .collect();
        let answer_text = rewrite_markers(&answer.text, &rendered_map);
        let mut rendered: Vec<String> = Vec::new();
        for c in citations.iter() {
            let r = c.render();
            if !rendered.contains(&r) {
                rendered.push(r);
            }
        }

        trace.checkpoint(cancel, QueryState::Audited)?;
        let audit = self
            .audit
            .record(AuditRecordInput {
                query_id: query_id.clone(),
                query_text: text,
                answer_text: answer_text.clone(),
                citations: rendered.clone(),
                outcome: QueryOutcome::Answered,
                generator: Some(answer.generator.clone()),
                model_version: answer.model_version.clone(),
                embedding_version: embedded.model.clone(),
                index_generation: self.snapshot.generation().to_string(),
                degradations: degradations.clone(),
            })
            .map_err(|e| trace.fail(e))?;
        trace.enter(QueryState::Audited);
        trace.enter(QueryState::Responded);

        info!(
            query_id = %query_id,
            outcome = "answered",
            generator = %answer.generator,
            citations = citations.len(),
            degradations = degradations.len(),
            "query answered"
        );
        Ok(QueryResponse {
            query_id,
            outcome: QueryOutcome::Answered,
            answer: answer_text,
            citations,
            rendered_citations: rendered,
            generator: Some(answer.generator),
            transitions: trace.states,
            degradations,
            audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_is_shared_between_clones() {
        let a = CancellationToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
        let err = check_cancel(&b, QueryState::Embedding).unwrap_err();
        assert!(err.is(ErrorKind::Cancelled));
    }
}
