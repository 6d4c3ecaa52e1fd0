//! Minimal client for OpenAI-compatible HTTP APIs (`/embeddings`, `/chat/completions`).

use std::time::Duration;

use marc_core::error::{AppError, ErrorKind};

#[derive(Clone)]
pub struct RemoteClient {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_ms: u64) -> Result<Self, AppError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(AppError::new(
                ErrorKind::Config,
                "AI_REMOTE_URL_INVALID",
                "Remote provider URL must be http(s)",
            )
            .with_details(format!("api_url={base_url}")));
        }
        Ok(Self {
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout: Duration::from_millis(timeout_ms.max(1)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
        code: &str,
    ) -> Result<serde_json::Value, AppError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = ureq::post(&url).timeout(self.timeout);
        if let Some(key) = self.api_key.as_ref() {
            req = req.set("Authorization", &format!("Bearer {key}"));
        }
        match req.send_json(body) {
            Ok(r) => r.into_json::<serde_json::Value>().map_err(|e| {
                AppError::new(ErrorKind::ProviderUnavailable, code, "Failed to decode remote response")
                    .with_details(format!("url={url}; err={e}"))
            }),
            Err(ureq::Error::Status(status, _)) => Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                code,
                "Remote provider rejected the request",
            )
            .with_details(format!("url={url}; status={status}"))
            .with_retryable(status == 429 || status >= 500)),
            Err(e) => Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                code,
                "Remote provider unreachable",
            )
            .with_details(format!("url={url}; err={e}"))
            .with_retryable(true)),
        }
    }
}
