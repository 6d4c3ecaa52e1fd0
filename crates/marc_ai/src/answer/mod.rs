use marc_core::error::{AppError, ErrorKind};
use serde::{Deserialize, Serialize};

use crate::guardrails::{enforce_citations, ensure_citations_allowed, extract_cited_chunk_ids};
use crate::llm::Llm;

mod prompts;

pub const TEMPLATE_MODEL: &str = "template-v1";

const TEMPLATE_EXCERPT_MAX_CHARS: usize = 240;

const TEMPLATE_SKIP_WORDS: &[&str] = &[
    "about", "does", "from", "have", "that", "there", "this", "were", "what", "when", "where",
    "which", "with",
];

/// One retrieved chunk handed to a generator, with its rendered citation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextChunk {
    pub chunk_id: String,
    pub meeting_id: String,
    pub date: String,
    pub citation: String,
    pub score: f32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedAnswer {
    /// Answer text with `[[chunk:<id>]]` markers still in place.
    pub text: String,
    pub cited_chunk_ids: Vec<String>,
    pub generator: String,
    pub model_version: String,
}

pub trait AnswerGenerator {
    fn name(&self) -> &str;

    fn model_version(&self) -> &str;

    fn generate(&self, query: &str, context: &[ContextChunk]) -> Result<GeneratedAnswer, AppError>;
}

fn require_context(context: &[ContextChunk]) -> Result<(), AppError> {
    if context.is_empty() {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            "AI_CONTEXT_EMPTY",
            "Answer generation needs at least one retrieved chunk",
        ));
    }
    Ok(())
}

/// LLM-backed generator. Output must pass the citation guardrails.
pub struct ModelAnswerGenerator {
    name: String,
    model: String,
    llm: Box<dyn Llm>,
}

impl ModelAnswerGenerator {
    pub fn new(name: &str, model: &str, llm: Box<dyn Llm>) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            llm,
        }
    }
}

fn context_blocks(context: &[ContextChunk]) -> String {
    context
        .iter()
        .map(|c| format!("[[chunk:{}]] {}\n{}", c.chunk_id, c.citation, c.text))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

impl AnswerGenerator for ModelAnswerGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_version(&self) -> &str {
        &self.model
    }

    fn generate(&self, query: &str, context: &[ContextChunk]) -> Result<GeneratedAnswer, AppError> {
        require_context(context)?;
        let prompt = prompts::grounded_answer_prompt(query, &context_blocks(context));
        let text = self.llm.generate(&self.model, &prompt)?;

        enforce_citations(&text)?;
        let cited = extract_cited_chunk_ids(&text);
        let allowed: Vec<String> = context.iter().map(|c| c.chunk_id.clone()).collect();
        ensure_citations_allowed(&cited, &allowed)?;

        Ok(GeneratedAnswer {
            text: text.trim().to_string(),
            cited_chunk_ids: cited,
            generator: self.name.clone(),
            model_version: self.model.clone(),
        })
    }
}

/// Deterministic generator: lists the relevant lines of each retrieved chunk. Needs no model.
pub struct TemplateAnswerGenerator {
    model: String,
}

impl TemplateAnswerGenerator {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| t.chars().count() > 3 && !TEMPLATE_SKIP_WORDS.contains(&t.as_str()))
        .collect()
}

fn relevant_excerpt(text: &str, terms: &[String]) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let matching: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| {
            let lower = l.to_lowercase();
            terms.iter().any(|t| lower.contains(t.as_str()))
        })
        .collect();
    let picked = if matching.is_empty() {
        lines.into_iter().take(1).collect::<Vec<_>>()
    } else {
        matching
    };
    let joined = picked.join(" ");
    if joined.chars().count() <= TEMPLATE_EXCERPT_MAX_CHARS {
        return joined;
    }
    let mut s: String = joined.chars().take(TEMPLATE_EXCERPT_MAX_CHARS).collect();
    s.push_str("...");
    s
}

impl AnswerGenerator for TemplateAnswerGenerator {
    fn name(&self) -> &str {
        "template"
    }

    fn model_version(&self) -> &str {
        &self.model
    }

    fn generate(&self, query: &str, context: &[ContextChunk]) -> Result<GeneratedAnswer, AppError> {
        require_context(context)?;
        let terms = query_terms(query);
        let mut lines = vec![format!(
            "Archive records relevant to \"{}\":",
            query.trim()
        )];
        let mut cited = Vec::new();
        for (i, c) in context.iter().enumerate() {
            lines.push(format!(
                "{}. {} [[chunk:{}]]",
                i + 1,
                relevant_excerpt(&c.text, &terms),
                c.chunk_id
            ));
            cited.push(c.chunk_id.clone());
        }
        Ok(GeneratedAnswer {
            text: lines.join("\n"),
            cited_chunk_ids: cited,
            generator: "template".to_string(),
            model_version: self.model.clone(),
        })
    }
}

/// Ordered generation strategies, tried until one succeeds.
#[derive(Default)]
pub struct GenerationChain {
    generators: Vec<Box<dyn AnswerGenerator>>,
}

impl GenerationChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, generator: Box<dyn AnswerGenerator>) {
        self.generators.push(generator);
    }

    pub fn generator_names(&self) -> Vec<String> {
        self.generators.iter().map(|g| g.name().to_string()).collect()
    }

    pub fn generators(&self) -> &[Box<dyn AnswerGenerator>] {
        &self.generators
    }
}
