use marc_core::error::AppError;

pub trait Embedder {
    fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, AppError>;
}

pub mod chain;
pub mod hashing;
pub mod ollama_embed;
pub mod remote_embed;

pub use chain::{EmbeddingChain, EmbeddingProvider, EmbeddingResult};
pub use hashing::HashingEmbedder;
pub use ollama_embed::OllamaEmbedder;
pub use remote_embed::RemoteEmbedder;
