pub mod answer;
pub mod audit;
pub mod chunking;
pub mod citation;
pub mod embeddings;
pub mod guardrails;
pub mod index;
pub mod llm;
pub mod ollama;
pub mod orchestrator;
pub mod providers;
pub mod remote;
pub mod retrieve;
