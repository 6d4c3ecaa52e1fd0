//! Process configuration.
//!
//! `Settings` is built once (from YAML or in code), validated, and then passed by reference to
//! everything that needs it. Nothing in the workspace reads provider settings from globals.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorKind};

pub const EMBEDDING_API_KEY_ENV: &str = "MARC_EMBEDDING_API_KEY";
pub const GENERATION_API_KEY_ENV: &str = "MARC_GENERATION_API_KEY";

pub const DEFAULT_LOCAL_URL: &str = "http://127.0.0.1:11434";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// Ollama on 127.0.0.1.
    Local,
    /// OpenAI-compatible HTTP API.
    Remote,
    /// In-process, no network: hashing embedder or template generator.
    Builtin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackSettings {
    pub provider: ProviderMode,
    #[serde(default)]
    pub api_url: Option<String>,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    pub provider: ProviderMode,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model_id: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub fallback: Option<FallbackSettings>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl ProviderSettings {
    pub fn builtin(model_id: impl Into<String>) -> Self {
        Self {
            provider: ProviderMode::Builtin,
            api_url: None,
            api_key: None,
            model_id: model_id.into(),
            timeout_ms: default_timeout_ms(),
            fallback: None,
        }
    }

    fn validate(&self, section: &str) -> Result<(), AppError> {
        if self.model_id.trim().is_empty() {
            return Err(config_error("CONFIG_MODEL_ID_REQUIRED", "Provider model_id is required")
                .with_details(format!("section={section}")));
        }
        if self.timeout_ms == 0 {
            return Err(config_error("CONFIG_TIMEOUT_INVALID", "Provider timeout_ms must be > 0")
                .with_details(format!("section={section}")));
        }
        if self.provider == ProviderMode::Remote {
            if self.api_url.as_deref().unwrap_or("").trim().is_empty() {
                return Err(config_error(
                    "CONFIG_REMOTE_URL_REQUIRED",
                    "Remote provider requires api_url",
                )
                .with_details(format!("section={section}")));
            }
            let fallback = self.fallback.as_ref().ok_or_else(|| {
                config_error(
                    "CONFIG_REMOTE_FALLBACK_REQUIRED",
                    "Remote provider must declare a local fallback",
                )
                .with_details(format!("section={section}"))
            })?;
            if fallback.provider == ProviderMode::Remote {
                return Err(config_error(
                    "CONFIG_FALLBACK_NOT_LOCAL",
                    "Provider fallback must be local or builtin",
                )
                .with_details(format!("section={section}")));
            }
            if fallback.model_id.trim().is_empty() {
                return Err(config_error(
                    "CONFIG_MODEL_ID_REQUIRED",
                    "Fallback model_id is required",
                )
                .with_details(format!("section={section}.fallback")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkingSettings {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            size: 512,
            overlap: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub min_score: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IndexSettings {
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersonMatchPolicy {
    /// Near-duplicate names create a new person and raise a flag.
    #[default]
    FlagOnly,
    /// Merge when exactly one existing person is similar enough; otherwise flag.
    AutoMerge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeopleSettings {
    #[serde(default)]
    pub match_policy: PersonMatchPolicy,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

fn default_similarity_threshold() -> f64 {
    0.85
}

impl Default for PeopleSettings {
    fn default() -> Self {
        Self {
            match_policy: PersonMatchPolicy::FlagOnly,
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IngestSettings {
    #[serde(default)]
    pub verify_hash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub embedding: ProviderSettings,
    pub generation: ProviderSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub index: IndexSettings,
    #[serde(default)]
    pub people: PeopleSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
}

impl Settings {
    /// Offline defaults: builtin hashing embeddings and template answers.
    pub fn offline(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            embedding: ProviderSettings::builtin("hashing-v1"),
            generation: ProviderSettings::builtin("template-v1"),
            chunking: ChunkingSettings::default(),
            retrieval: RetrievalSettings::default(),
            index: IndexSettings::default(),
            people: PeopleSettings::default(),
            ingest: IngestSettings::default(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, AppError> {
        let mut settings: Settings = serde_yaml::from_str(text).map_err(|e| {
            config_error("CONFIG_PARSE_FAILED", "Failed to parse configuration")
                .with_details(e.to_string())
        })?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = fs::read_to_string(path).map_err(|e| {
            config_error("CONFIG_READ_FAILED", "Failed to read configuration file")
                .with_details(format!("path={}; err={}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(EMBEDDING_API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.embedding.api_key = Some(key);
            }
        }
        if let Ok(key) = std::env::var(GENERATION_API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.generation.api_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(config_error("CONFIG_DATA_DIR_REQUIRED", "data_dir is required"));
        }
        self.embedding.validate("embedding")?;
        self.generation.validate("generation")?;
        if self.chunking.size == 0 {
            return Err(config_error("CONFIG_CHUNK_SIZE_INVALID", "chunking.size must be > 0"));
        }
        if self.chunking.overlap >= self.chunking.size {
            return Err(config_error(
                "CONFIG_CHUNK_OVERLAP_INVALID",
                "chunking.overlap must be smaller than chunking.size",
            )
            .with_details(format!(
                "size={}; overlap={}",
                self.chunking.size, self.chunking.overlap
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(config_error("CONFIG_TOP_K_INVALID", "retrieval.top_k must be >= 1"));
        }
        if !self.retrieval.min_score.is_finite() {
            return Err(config_error(
                "CONFIG_MIN_SCORE_INVALID",
                "retrieval.min_score must be a finite number",
            ));
        }
        let t = self.people.similarity_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(config_error(
                "CONFIG_SIMILARITY_INVALID",
                "people.similarity_threshold must be within [0, 1]",
            )
            .with_details(format!("value={t}")));
        }
        Ok(())
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }
}

fn config_error(code: &str, message: &str) -> AppError {
    AppError::new(ErrorKind::Config, code, message)
}
