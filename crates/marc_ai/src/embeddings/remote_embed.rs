use marc_core::error::{AppError, ErrorKind};

use super::ollama_embed::bounded;
use super::Embedder;
use crate::remote::RemoteClient;

/// OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct RemoteEmbedder {
    client: RemoteClient,
}

impl RemoteEmbedder {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

impl Embedder for RemoteEmbedder {
    fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, AppError> {
        let body = serde_json::json!({
            "model": model,
            "input": bounded(input, 12_000),
        });
        let v = self
            .client
            .post_json("/embeddings", body, "AI_REMOTE_EMBEDDINGS_FAILED")?;
        let raw = v["data"][0]["embedding"].as_array().ok_or_else(|| {
            AppError::new(
                ErrorKind::ProviderUnavailable,
                "AI_REMOTE_EMBEDDINGS_FAILED",
                "Embeddings response has no data[0].embedding",
            )
        })?;
        let mut out = Vec::with_capacity(raw.len());
        for x in raw {
            let f = x.as_f64().ok_or_else(|| {
                AppError::new(
                    ErrorKind::ProviderUnavailable,
                    "AI_REMOTE_EMBEDDINGS_FAILED",
                    "Embedding contains a non-numeric value",
                )
            })?;
            out.push(f as f32);
        }
        if out.is_empty() {
            return Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                "AI_REMOTE_EMBEDDINGS_FAILED",
                "Embeddings response was empty",
            ));
        }
        Ok(out)
    }
}
