use marc_core::error::{AppError, ErrorKind};
use tracing::warn;

use super::Embedder;
use crate::providers::{Degradation, Stage};

pub struct EmbeddingProvider {
    name: String,
    model: String,
    embedder: Box<dyn Embedder>,
}

impl EmbeddingProvider {
    pub fn new(name: &str, model: &str, embedder: Box<dyn Embedder>) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            embedder,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    pub vector: Vec<f32>,
    pub provider: String,
    pub model: String,
    pub degradations: Vec<Degradation>,
}

/// Ordered embedding strategies. Vectors from different models are not comparable, so when a
/// required model is given, providers configured for another model are skipped.
pub struct EmbeddingChain {
    providers: Vec<EmbeddingProvider>,
}

impl EmbeddingChain {
    pub fn new(providers: Vec<EmbeddingProvider>) -> Self {
        Self { providers }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }

    /// Model of the first provider; index builds embed with it.
    pub fn primary(&self) -> Option<&EmbeddingProvider> {
        self.providers.first()
    }

    pub fn embed(&self, required_model: Option<&str>, text: &str) -> Result<EmbeddingResult, AppError> {
        let mut degradations: Vec<Degradation> = Vec::new();
        for p in self.providers.iter() {
            if let Some(m) = required_model {
                if p.model != m {
                    degradations.push(Degradation {
                        stage: Stage::Embedding,
                        provider: p.name.clone(),
                        code: "AI_EMBEDDING_MODEL_MISMATCH".to_string(),
                        message: format!("provider model {} differs from index model {}", p.model, m),
                    });
                    continue;
                }
            }
            match p.embedder.embed(&p.model, text) {
                Ok(vector) => {
                    return Ok(EmbeddingResult {
                        vector,
                        provider: p.name.clone(),
                        model: p.model.clone(),
                        degradations,
                    })
                }
                Err(e) => {
                    warn!(provider = %p.name, code = %e.code, "embedding provider failed; trying next");
                    degradations.push(Degradation::from_error(Stage::Embedding, &p.name, &e));
                }
            }
        }

        let tried = degradations
            .iter()
            .map(|d| format!("{}:{}", d.provider, d.code))
            .collect::<Vec<_>>()
            .join(",");
        Err(AppError::new(
            ErrorKind::ProviderUnavailable,
            "AI_EMBEDDING_UNAVAILABLE",
            "No embedding provider could embed the text",
        )
        .with_details(format!("required_model={}; tried={tried}", required_model.unwrap_or("-"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;

    struct Down;

    impl Embedder for Down {
        fn embed(&self, _model: &str, _input: &str) -> Result<Vec<f32>, AppError> {
            Err(AppError::new(ErrorKind::ProviderUnavailable, "AI_REMOTE_EMBEDDINGS_FAILED", "timeout"))
        }
    }

    #[test]
    fn falls_through_to_the_next_provider_and_records_why() {
        let chain = EmbeddingChain::new(vec![
            EmbeddingProvider::new("remote", "hashing-v1", Box::new(Down)),
            EmbeddingProvider::new("builtin", "hashing-v1", Box::new(HashingEmbedder::default())),
        ]);
        let out = chain.embed(Some("hashing-v1"), "budget").unwrap();
        assert_eq!(out.provider, "builtin");
        assert_eq!(out.degradations.len(), 1);
        assert_eq!(out.degradations[0].code, "AI_REMOTE_EMBEDDINGS_FAILED");
    }

    #[test]
    fn providers_for_other_models_are_skipped() {
        let chain = EmbeddingChain::new(vec![EmbeddingProvider::new(
            "builtin",
            "hashing-v1",
            Box::new(HashingEmbedder::default()),
        )]);
        let err = chain.embed(Some("nomic-embed-text"), "budget").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
        assert!(err.details.unwrap().contains("AI_EMBEDDING_MODEL_MISMATCH"));
    }
}
