use std::time::Duration;

use marc_core::error::{AppError, ErrorKind};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    timeout: Duration,
}

/// Accept `http://127.0.0.1` with an optional numeric port and nothing after it.
fn is_loopback_base_url(base_url: &str) -> bool {
    let Some(rest) = base_url.strip_prefix("http://127.0.0.1") else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let Some(port) = rest.strip_prefix(':') else {
        return false;
    };
    if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    matches!(port.parse::<u32>(), Ok(p) if (1..=65_535).contains(&p))
}

impl OllamaClient {
    /// Create a client for Ollama. This is strictly limited to `127.0.0.1`.
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();

        if !is_loopback_base_url(&base_url) {
            return Err(AppError::new(
                ErrorKind::Config,
                "AI_REMOTE_NOT_ALLOWED",
                "Ollama base URL must be localhost (127.0.0.1)",
            )
            .with_details(format!("base_url={base_url}")));
        }

        Ok(Self {
            base_url,
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms.max(1));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn health_check(&self) -> Result<(), AppError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = ureq::get(&url)
            .timeout(Duration::from_millis(800))
            .call();

        match resp {
            Ok(r) if r.status() == 200 => Ok(()),
            Ok(r) => Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                "AI_OLLAMA_UNHEALTHY",
                "Ollama health check failed",
            )
            .with_details(format!("status={}", r.status()))),
            Err(e) => Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                "AI_OLLAMA_UNREACHABLE",
                "Failed to reach Ollama on 127.0.0.1",
            )
            .with_details(e.to_string())
            .with_retryable(true)),
        }
    }

    /// POST a JSON body to an Ollama API path and decode the JSON reply.
    pub(crate) fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
        code: &str,
    ) -> Result<T, AppError> {
        let url = format!("{}{}", self.base_url, path);
        match ureq::post(&url).timeout(self.timeout).send_json(body) {
            Ok(r) => r.into_json::<T>().map_err(|e| {
                AppError::new(ErrorKind::ProviderUnavailable, code, "Failed to decode Ollama response")
                    .with_details(format!("url={url}; err={e}"))
            }),
            Err(ureq::Error::Status(status, _)) => Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                code,
                "Ollama request failed",
            )
            .with_details(format!("url={url}; status={status}"))
            .with_retryable(status >= 500)),
            Err(e) => Err(AppError::new(
                ErrorKind::ProviderUnavailable,
                code,
                "Failed to call Ollama",
            )
            .with_details(format!("url={url}; err={e}"))
            .with_retryable(true)),
        }
    }
}
