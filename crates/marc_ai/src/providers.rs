//! Provider wiring: turns `Settings` into ordered fallback chains.
//!
//! Order is primary, then the declared fallback, then (for generation only) the builtin
//! template generator so a query with evidence always gets an answer.

use marc_core::config::{FallbackSettings, ProviderMode, ProviderSettings, Settings};
use marc_core::error::{AppError, ErrorKind};
use serde::{Deserialize, Serialize};

use crate::answer::{GenerationChain, ModelAnswerGenerator, TemplateAnswerGenerator, TEMPLATE_MODEL};
use crate::embeddings::{
    EmbeddingChain, EmbeddingProvider, HashingEmbedder, OllamaEmbedder, RemoteEmbedder,
};
use crate::llm::{OllamaLlm, RemoteLlm};
use crate::ollama::OllamaClient;
use crate::remote::RemoteClient;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Embedding,
    Generation,
}

/// One provider that was tried and skipped. Recorded in the audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Degradation {
    pub stage: Stage,
    pub provider: String,
    pub code: String,
    pub message: String,
}

impl Degradation {
    pub fn from_error(stage: Stage, provider: &str, err: &AppError) -> Self {
        let message = match err.details.as_deref() {
            Some(d) => format!("{} ({d})", err.message),
            None => err.message.clone(),
        };
        Self {
            stage,
            provider: provider.to_string(),
            code: err.code.clone(),
            message,
        }
    }
}

/// Provider name used in degradations and audit entries.
pub fn provider_label(mode: ProviderMode) -> &'static str {
    match mode {
        ProviderMode::Local => "local",
        ProviderMode::Remote => "remote",
        ProviderMode::Builtin => "builtin",
    }
}

struct ProviderEntry {
    mode: ProviderMode,
    api_url: Option<String>,
    api_key: Option<String>,
    model_id: String,
    timeout_ms: u64,
}

fn entries(p: &ProviderSettings) -> Vec<ProviderEntry> {
    let mut out = vec![ProviderEntry {
        mode: p.provider,
        api_url: p.api_url.clone(),
        api_key: p.api_key.clone(),
        model_id: p.model_id.clone(),
        timeout_ms: p.timeout_ms,
    }];
    if let Some(FallbackSettings {
        provider,
        api_url,
        model_id,
    }) = p.fallback.as_ref()
    {
        out.push(ProviderEntry {
            mode: *provider,
            api_url: api_url.clone(),
            api_key: None,
            model_id: model_id.clone(),
            timeout_ms: p.timeout_ms,
        });
    }
    out
}

fn remote_client(s: &ProviderEntry) -> Result<RemoteClient, AppError> {
    let url = s.api_url.as_deref().ok_or_else(|| {
        AppError::new(ErrorKind::Config, "CONFIG_REMOTE_URL_REQUIRED", "Remote provider needs api_url")
    })?;
    RemoteClient::new(url, s.api_key.clone(), s.timeout_ms)
}

fn ollama_client(s: &ProviderEntry) -> Result<OllamaClient, AppError> {
    let url = s
        .api_url
        .as_deref()
        .unwrap_or(marc_core::config::DEFAULT_LOCAL_URL);
    Ok(OllamaClient::new(url)?.with_timeout_ms(s.timeout_ms))
}

pub fn build_embedding_chain(settings: &Settings) -> Result<EmbeddingChain, AppError> {
    let mut providers = Vec::new();
    for s in entries(&settings.embedding) {
        let embedder: Box<dyn crate::embeddings::Embedder> = match s.mode {
            ProviderMode::Remote => Box::new(RemoteEmbedder::new(remote_client(&s)?)),
            ProviderMode::Local => Box::new(OllamaEmbedder::new(ollama_client(&s)?)),
            ProviderMode::Builtin => Box::new(HashingEmbedder::default()),
        };
        providers.push(EmbeddingProvider::new(provider_label(s.mode), &s.model_id, embedder));
    }
    Ok(EmbeddingChain::new(providers))
}

pub fn build_generation_chain(settings: &Settings) -> Result<GenerationChain, AppError> {
    let mut chain = GenerationChain::new();
    let mut has_template = false;
    for s in entries(&settings.generation) {
        match s.mode {
            ProviderMode::Remote => chain.push(Box::new(ModelAnswerGenerator::new(
                provider_label(s.mode),
                &s.model_id,
                Box::new(RemoteLlm::new(remote_client(&s)?)),
            ))),
            ProviderMode::Local => chain.push(Box::new(ModelAnswerGenerator::new(
                provider_label(s.mode),
                &s.model_id,
                Box::new(OllamaLlm::new(ollama_client(&s)?)),
            ))),
            ProviderMode::Builtin => {
                has_template = true;
                chain.push(Box::new(TemplateAnswerGenerator::new(&s.model_id)));
            }
        }
    }
    if !has_template {
        chain.push(Box::new(TemplateAnswerGenerator::new(TEMPLATE_MODEL)));
    }
    Ok(chain)
}
