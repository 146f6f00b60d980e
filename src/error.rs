//! Error types for the suggestion pipeline.
//!
//! Per-file failures during vectorization are absorbed into the run's
//! `details` log and never surface through this type; everything here is
//! either a run-level fault or a per-request error that callers must see.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A required setting is absent; the operation is refused up front.
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    /// An external backend (embedding, generation, repository) could not
    /// be reached. Retryable at the caller's discretion.
    #[error("{service} unreachable: {message}")]
    BackendUnreachable {
        service: &'static str,
        message: String,
    },

    /// The embedding backend failed or the model is not loaded.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The query was embedded with a different model than the active index.
    /// Fatal to the query; the index must be rebuilt to switch models.
    #[error("Embedding model mismatch: index built with '{index_model}', query uses '{query_model}'")]
    ModelMismatch {
        index_model: String,
        query_model: String,
    },

    /// The language-model backend failed during suggestion generation.
    /// Surfaced to the caller as the request's terminal error.
    #[error("Generation unavailable: {0}")]
    GenerationUnavailable(String),

    /// A vectorization run is already active for this repository.
    #[error("Vectorization run {0} is already in progress")]
    RunAlreadyInProgress(Uuid),

    /// No vectorization run with the given identifier.
    #[error("Vectorization run not found: {0}")]
    RunNotFound(Uuid),

    /// Malformed input (empty query, out-of-range parameter).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Vector store errors.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn configuration_missing(msg: impl Into<String>) -> Self {
        Self::ConfigurationMissing(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for transient conditions a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnreachable { .. } | Self::EmbeddingUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ModelMismatch {
            index_model: "nomic-embed-text".to_string(),
            query_model: "all-minilm".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Embedding model mismatch: index built with 'nomic-embed-text', query uses 'all-minilm'"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::EmbeddingUnavailable("connection refused".into()).is_retryable());
        assert!(!Error::GenerationUnavailable("connection refused".into()).is_retryable());
        assert!(!Error::ConfigurationMissing("embedding.model".into()).is_retryable());
    }
}
