use marc_core::error::{AppError, ErrorKind};
use serde::{Deserialize, Serialize};

use super::Embedder;
use crate::ollama::OllamaClient;

#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: OllamaClient,
}

impl OllamaEmbedder {
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

/// Longest prefix of `input` that fits in `max` bytes without splitting a char.
pub(crate) fn bounded(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut end = max;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

impl Embedder for OllamaEmbedder {
    fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, AppError> {
        let prompt = bounded(input, 12_000);
        let body = serde_json::to_value(EmbeddingsRequest { model, prompt }).map_err(|e| {
            AppError::new(ErrorKind::ProviderUnavailable, "AI_EMBEDDINGS_FAILED", "Failed to encode embeddings request")
                .with_details(e.to_string())
        })?;
        let v: EmbeddingsResponse = self
            .client
            .post_json("/api/embeddings", body, "AI_EMBEDDINGS_FAILED")?;
        if v.embedding.is_empty() {
            return Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                "AI_EMBEDDINGS_FAILED",
                "Embeddings response was empty",
            ));
        }
        Ok(v.embedding)
    }
}
