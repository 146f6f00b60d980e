//! Embedding backend abstraction and the Ollama implementation.
//!
//! Defines the [`Embedder`] trait used by the vectorization and retrieval
//! paths, plus vector utilities shared with the store:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian f32 codec for
//!   SQLite BLOB storage
//!
//! # Retry strategy
//!
//! The Ollama backend makes at most `max_retries` additional attempts
//! (default 1) for transient failures: network errors, HTTP 429, and 5xx.
//! Other client errors fail immediately. Exhausted retries surface as
//! [`Error::EmbeddingUnavailable`], which the orchestrator records as a
//! per-file failure rather than aborting the run.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Maps text to fixed-length dense vectors. Deterministic for identical
/// text and model configuration.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"nomic-embed-text"`). An index is tagged
    /// with this value and refuses queries embedded with another model.
    fn model_name(&self) -> &str;

    /// Vector dimensionality, fixed per model.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning vectors in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text (e.g. a retrieval query).
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingUnavailable("empty embedding response".to_string()))
    }
}

/// Embedding client for an Ollama-compatible `/api/embed` endpoint.
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    dims: usize,
    max_retries: u32,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::EmbeddingUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims: config.dims,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/embed", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(4))).await;
            }

            let resp = self.client.post(&url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: EmbedResponse = response.json().await.map_err(|e| {
                            Error::EmbeddingUnavailable(format!("invalid response: {}", e))
                        })?;
                        return self.check_batch(texts.len(), parsed.embeddings);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        warn!(attempt, %status, "embedding backend error, retrying");
                        last_err = Some(format!("HTTP {}: {}", status, text));
                        continue;
                    }

                    let text = response.text().await.unwrap_or_default();
                    return Err(Error::EmbeddingUnavailable(format!(
                        "HTTP {}: {}",
                        status, text
                    )));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "embedding request failed, retrying");
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(Error::EmbeddingUnavailable(
            last_err.unwrap_or_else(|| "retries exhausted".to_string()),
        ))
    }
}

impl OllamaEmbedder {
    fn check_batch(&self, expected: usize, embeddings: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if embeddings.len() != expected {
            return Err(Error::EmbeddingUnavailable(format!(
                "expected {} vectors, got {}",
                expected,
                embeddings.len()
            )));
        }
        for vec in &embeddings {
            if vec.len() != self.dims {
                return Err(Error::EmbeddingUnavailable(format!(
                    "model '{}' returned {} dims, configured {}",
                    self.model,
                    vec.len(),
                    self.dims
                )));
            }
        }
        Ok(embeddings)
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two embedding vectors, clamped to `[0, 1]`.
///
/// Raw cosine lives in `[-1, 1]`; anti-correlated directions carry no
/// relevance signal for retrieval, so negatives clamp to `0.0`. Returns
/// `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_negative_clamps_to_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
