use marc_core::error::{AppError, ErrorKind};
use serde::{Deserialize, Serialize};

use super::Llm;
use crate::ollama::OllamaClient;

#[derive(Debug, Clone)]
pub struct OllamaLlm {
    client: OllamaClient,
}

impl OllamaLlm {
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }
}

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Clone, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl Llm for OllamaLlm {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, AppError> {
        let req = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };
        let body = serde_json::to_value(req).map_err(|e| {
            AppError::new(ErrorKind::ProviderUnavailable, "AI_GENERATE_FAILED", "Failed to encode generate request")
                .with_details(e.to_string())
        })?;
        let v: GenerateResponse = self.client.post_json("/api/generate", body, "AI_GENERATE_FAILED")?;
        if v.response.trim().is_empty() {
            return Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                "AI_GENERATE_FAILED",
                "Generate response was empty",
            ));
        }
        Ok(v.response)
    }
}
