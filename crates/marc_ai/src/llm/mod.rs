use marc_core::error::AppError;

pub trait Llm {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, AppError>;
}

pub mod ollama_llm;
pub mod remote_llm;

pub use ollama_llm::OllamaLlm;
pub use remote_llm::RemoteLlm;
