//! TOML configuration parsing and validation.
//!
//! All settings are read from a single TOML file. Validation happens at
//! load time: required settings that are absent surface as
//! [`Error::ConfigurationMissing`](crate::error::Error) before any
//! pipeline work begins; there is no silent fallback to hardcoded
//! defaults for backend endpoints or models.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub vectorize: VectorizeConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    /// Root of the repository checkout to vectorize.
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.py".to_string(),
        "**/*.yml".to_string(),
        "**/*.yaml".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap in characters between consecutive sliding windows.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_max_chunks_per_query")]
    pub max_chunks_per_query: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            max_chunks_per_query: default_max_chunks_per_query(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.7
}
fn default_max_chunks_per_query() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding backend (e.g. `http://localhost:11434`).
    pub base_url: String,
    /// Embedding model identifier (e.g. `nomic-embed-text`).
    pub model: String,
    /// Expected vector dimensionality for the model.
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    /// Bounded retry budget for transient backend errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_batch_size() -> usize {
    32
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Base URL of the generation backend (e.g. `http://localhost:11434`).
    pub base_url: String,
    /// Default generation model (e.g. `codellama`); overridable per request.
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_gen_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorizeConfig {
    /// Worker pool bound for per-file processing within a run.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for VectorizeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8900".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::ConfigurationMissing(format!("cannot read config file {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| Error::ConfigurationMissing(format!("invalid config file: {}", e)))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        return Err(Error::validation("chunking.chunk_size must be > 0"));
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        return Err(Error::validation(
            "chunking.chunk_overlap must be < chunking.chunk_size",
        ));
    }

    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        return Err(Error::validation(
            "retrieval.similarity_threshold must be in [0.0, 1.0]",
        ));
    }
    if config.retrieval.max_chunks_per_query == 0 {
        return Err(Error::validation(
            "retrieval.max_chunks_per_query must be >= 1",
        ));
    }

    if config.embedding.base_url.is_empty() {
        return Err(Error::configuration_missing("embedding.base_url"));
    }
    if config.embedding.model.is_empty() {
        return Err(Error::configuration_missing("embedding.model"));
    }
    if config.embedding.dims == 0 {
        return Err(Error::validation("embedding.dims must be > 0"));
    }

    if config.generation.base_url.is_empty() {
        return Err(Error::configuration_missing("generation.base_url"));
    }
    if config.generation.model.is_empty() {
        return Err(Error::configuration_missing("generation.model"));
    }

    if config.vectorize.concurrency == 0 {
        return Err(Error::validation("vectorize.concurrency must be >= 1"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
            [db]
            path = "/tmp/ragpatch.db"

            [repository]
            root = "/tmp/repo"

            [embedding]
            base_url = "http://localhost:11434"
            model = "nomic-embed-text"
            dims = 768

            [generation]
            base_url = "http://localhost:11434"
            model = "codellama"
        "#
        .to_string()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(&base_toml()).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.retrieval.max_chunks_per_query, 5);
        assert!((config.retrieval.similarity_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.vectorize.concurrency, 4);
        assert_eq!(config.embedding.max_retries, 1);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk_size() {
        let toml_str = format!(
            "{}\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n",
            base_toml()
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_embedding_model_refused() {
        let toml_str = base_toml().replace("model = \"nomic-embed-text\"", "model = \"\"");
        let config: Config = toml::from_str(&toml_str).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, Error::ConfigurationMissing(_)));
    }

    #[test]
    fn test_threshold_range_checked() {
        let toml_str = format!(
            "{}\n[retrieval]\nsimilarity_threshold = 1.5\n",
            base_toml()
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }
}
