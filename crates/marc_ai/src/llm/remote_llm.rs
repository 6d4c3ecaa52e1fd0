use marc_core::error::{AppError, ErrorKind};

use super::Llm;
use crate::remote::RemoteClient;

/// OpenAI-compatible `/chat/completions`; the prompt goes in as one user message.
#[derive(Debug, Clone)]
pub struct RemoteLlm {
    client: RemoteClient,
}

impl RemoteLlm {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

impl Llm for RemoteLlm {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, AppError> {
        let body = serde_json::json!({
            "model": model,
            "temperature": 0,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let v = self
            .client
            .post_json("/chat/completions", body, "AI_REMOTE_GENERATE_FAILED")?;
        let text = v["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if text.trim().is_empty() {
            return Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                "AI_REMOTE_GENERATE_FAILED",
                "Completion response was empty",
            ));
        }
        Ok(text)
    }
}
