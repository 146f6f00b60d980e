//! Query-side retrieval: embed a free-text query and find the most
//! similar stored chunks.
//!
//! The retriever guards the model boundary: a query embedded with a
//! different model than the one that built the active index is rejected
//! with [`Error::ModelMismatch`] rather than silently compared. An empty
//! result set is a valid outcome, not an error; callers treat "no
//! similar code found" as a first-class case.

use std::sync::Arc;
use tracing::debug;

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::models::RetrievalResult;
use crate::store::VectorStore;

pub struct Retriever {
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(store: VectorStore, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Top-`top_k` chunks with similarity `>= threshold` for `query_text`,
    /// most similar first.
    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievalResult>> {
        if query_text.trim().is_empty() {
            return Err(Error::validation("query text must not be empty"));
        }

        // Refuse to compare vectors across index generations.
        if let Some((index_model, _)) = self.store.index_model().await? {
            if index_model != self.embedder.model_name() {
                return Err(Error::ModelMismatch {
                    index_model,
                    query_model: self.embedder.model_name().to_string(),
                });
            }
        }

        let vector = self.embedder.embed(query_text).await?;
        let results = self.store.query(&vector, top_k, threshold).await?;
        debug!(
            hits = results.len(),
            top_k, threshold, "retrieval query complete"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CodeChunk;
    use crate::{db, migrate};
    use async_trait::async_trait;
    use chrono::Utc;

    /// Deterministic test embedder: a fixed direction per known text.
    struct StubEmbedder {
        model: String,
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn model_name(&self) -> &str {
            &self.model
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("upload") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    async fn seeded_store() -> (VectorStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("test.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let store = VectorStore::new(pool);
        store.ensure_model("stub-model", 2).await.unwrap();

        let chunks = vec![
            chunk("handlers.py", "def handle_upload(request): ...", vec![0.95, 0.3122499]),
            chunk("auth.py", "def check_token(token): ...", vec![0.1, 0.9949874]),
        ];
        for c in &chunks {
            store
                .upsert_chunks(&c.file_path, std::slice::from_ref(c))
                .await
                .unwrap();
        }
        (store, dir)
    }

    fn chunk(file: &str, content: &str, embedding: Vec<f32>) -> CodeChunk {
        CodeChunk {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: file.to_string(),
            language: "python".to_string(),
            function_name: None,
            content: content.to_string(),
            start_line: 1,
            end_line: 1,
            embedding,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_retrieve_orders_and_thresholds() {
        let (store, _dir) = seeded_store().await;
        let retriever = Retriever::new(
            store,
            Arc::new(StubEmbedder {
                model: "stub-model".to_string(),
            }),
        );

        let results = retriever
            .retrieve("file upload handling", 5, 0.7)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].chunk.content.contains("handle_upload"));
        assert!(results[0].similarity_score >= 0.7);
    }

    #[tokio::test]
    async fn test_repeated_retrieval_identical() {
        let (store, _dir) = seeded_store().await;
        let retriever = Retriever::new(
            store,
            Arc::new(StubEmbedder {
                model: "stub-model".to_string(),
            }),
        );

        let first = retriever
            .retrieve("file upload handling", 5, 0.7)
            .await
            .unwrap();
        let second = retriever
            .retrieve("file upload handling", 5, 0.7)
            .await
            .unwrap();
        let ids: Vec<_> = first.iter().map(|r| r.chunk.id.clone()).collect();
        let ids2: Vec<_> = second.iter().map(|r| r.chunk.id.clone()).collect();
        assert_eq!(ids, ids2);
    }

    #[tokio::test]
    async fn test_model_mismatch_rejected() {
        let (store, _dir) = seeded_store().await;
        let retriever = Retriever::new(
            store,
            Arc::new(StubEmbedder {
                model: "other-model".to_string(),
            }),
        );

        let err = retriever.retrieve("anything", 5, 0.7).await.unwrap_err();
        assert!(matches!(err, Error::ModelMismatch { .. }));
    }

    #[tokio::test]
    async fn test_empty_store_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("test.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let retriever = Retriever::new(
            VectorStore::new(pool),
            Arc::new(StubEmbedder {
                model: "stub-model".to_string(),
            }),
        );

        let results = retriever.retrieve("anything", 5, 0.7).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let (store, _dir) = seeded_store().await;
        let retriever = Retriever::new(
            store,
            Arc::new(StubEmbedder {
                model: "stub-model".to_string(),
            }),
        );
        assert!(retriever.retrieve("   ", 5, 0.7).await.is_err());
    }
}
