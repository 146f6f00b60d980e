//! Chunk persistence and nearest-neighbor queries over SQLite.
//!
//! The store exclusively owns [`CodeChunk`] persistence. Writes are scoped
//! to one file's chunk set and happen in a single transaction
//! (delete-then-insert), so no reader ever observes a mix of old and new
//! chunks for the same file. Queries scan stored vectors and rank by
//! cosine similarity in Rust: an exact scan, sized for repository-scale
//! corpora rather than a production ANN index.
//!
//! An index is tagged with the embedding model that produced it
//! ([`VectorStore::ensure_model`]); writes and queries against a
//! differently-tagged index are refused instead of silently compared.

use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{CodeChunk, CodeSuggestion, RetrievalResult};

const META_MODEL: &str = "embedding_model";
const META_DIMS: &str = "embedding_dims";

/// Aggregate counts for status displays.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub chunk_count: u64,
    pub file_count: u64,
    pub embedding_model: Option<String>,
}

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The model tag of the active index generation, if any chunks have
    /// been written.
    pub async fn index_model(&self) -> Result<Option<(String, usize)>> {
        let model: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
                .bind(META_MODEL)
                .fetch_optional(&self.pool)
                .await?;

        let Some(model) = model else {
            return Ok(None);
        };

        let dims: Option<String> = sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
            .bind(META_DIMS)
            .fetch_optional(&self.pool)
            .await?;
        let dims = dims.and_then(|d| d.parse::<usize>().ok()).unwrap_or(0);

        Ok(Some((model, dims)))
    }

    /// Tag the index with `model`/`dims` on first write; on later calls,
    /// verify the tag matches. Mixing vectors from different models within
    /// one index generation is refused.
    pub async fn ensure_model(&self, model: &str, dims: usize) -> Result<()> {
        match self.index_model().await? {
            None => {
                sqlx::query("INSERT OR REPLACE INTO index_meta (key, value) VALUES (?, ?)")
                    .bind(META_MODEL)
                    .bind(model)
                    .execute(&self.pool)
                    .await?;
                sqlx::query("INSERT OR REPLACE INTO index_meta (key, value) VALUES (?, ?)")
                    .bind(META_DIMS)
                    .bind(dims.to_string())
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            Some((existing, _)) if existing == model => Ok(()),
            Some((existing, _)) => Err(Error::ModelMismatch {
                index_model: existing,
                query_model: model.to_string(),
            }),
        }
    }

    /// Atomically replace all chunks previously associated with
    /// `file_path` with the new set. Callers never observe a partial mix
    /// of old and new chunks for the file.
    pub async fn upsert_chunks(&self, file_path: &str, chunks: &[CodeChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE file_path = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, file_path, language, function_name, content,
                     start_line, end_line, embedding, content_hash, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.file_path)
            .bind(&chunk.language)
            .bind(&chunk.function_name)
            .bind(&chunk.content)
            .bind(chunk.start_line as i64)
            .bind(chunk.end_line as i64)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(content_hash(&chunk.content))
            .bind(chunk.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Distinct file paths currently present in the index.
    pub async fn indexed_files(&self) -> Result<Vec<String>> {
        let files: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT file_path FROM chunks ORDER BY file_path")
                .fetch_all(&self.pool)
                .await?;
        Ok(files)
    }

    /// Remove all chunks for a file (used when the file is deleted from
    /// the repository). Returns the number of chunks removed.
    pub async fn delete_file(&self, file_path: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Nearest-neighbor query: at most `top_k` chunks with similarity
    /// `>= threshold`, ordered by descending score; ties broken by most
    /// recent `created_at`, then by id for full determinism.
    pub async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievalResult>> {
        if let Some((_, dims)) = self.index_model().await? {
            if dims != 0 && dims != vector.len() {
                return Err(Error::validation(format!(
                    "query vector has {} dims, index has {}",
                    vector.len(),
                    dims
                )));
            }
        }

        let rows = sqlx::query(
            r#"
            SELECT id, file_path, language, function_name, content,
                   start_line, end_line, embedding, created_at
            FROM chunks
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut results: Vec<RetrievalResult> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let embedding = blob_to_vec(&blob);
                let score = cosine_similarity(vector, &embedding);
                if score < threshold {
                    return None;
                }
                Some(RetrievalResult {
                    chunk: chunk_from_row(row, embedding),
                    similarity_score: score,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.chunk.created_at.cmp(&a.chunk.created_at))
                .then(a.chunk.id.cmp(&b.chunk.id))
        });
        results.truncate(top_k);

        Ok(results)
    }

    pub async fn chunk_count_for_file(&self, file_path: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE file_path = ?")
            .bind(file_path)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let file_count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT file_path) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let model = self.index_model().await?.map(|(m, _)| m);

        Ok(StoreStats {
            chunk_count: chunk_count as u64,
            file_count: file_count as u64,
            embedding_model: model,
        })
    }

    /// Record a generated suggestion for analytics.
    pub async fn insert_suggestion(&self, suggestion: &CodeSuggestion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO suggestions
                (id, ticket_id, explanation, confidence, model, processing_ms,
                 payload_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&suggestion.id)
        .bind(&suggestion.ticket_id)
        .bind(&suggestion.explanation)
        .bind(suggestion.confidence_score as f64)
        .bind(&suggestion.model_used)
        .bind(suggestion.processing_time_ms as i64)
        .bind(serde_json::to_string(suggestion)?)
        .bind(suggestion.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent suggestions, newest first.
    pub async fn recent_suggestions(&self, limit: usize) -> Result<Vec<CodeSuggestion>> {
        let rows =
            sqlx::query("SELECT payload_json FROM suggestions ORDER BY created_at DESC LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;

        let mut suggestions = Vec::with_capacity(rows.len());
        for row in &rows {
            let payload: String = row.get("payload_json");
            suggestions.push(serde_json::from_str(&payload)?);
        }
        Ok(suggestions)
    }
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow, embedding: Vec<f32>) -> CodeChunk {
    let created_ms: i64 = row.get("created_at");
    let start_line: i64 = row.get("start_line");
    let end_line: i64 = row.get("end_line");

    CodeChunk {
        id: row.get("id"),
        file_path: row.get("file_path"),
        language: row.get("language"),
        function_name: row.get("function_name"),
        content: row.get("content"),
        start_line: start_line as u32,
        end_line: end_line as u32,
        embedding,
        created_at: Utc
            .timestamp_millis_opt(created_ms)
            .single()
            .unwrap_or_else(Utc::now),
    }
}

fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use chrono::Duration;

    async fn test_store() -> (VectorStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("test.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (VectorStore::new(pool), dir)
    }

    fn make_chunk(file: &str, content: &str, embedding: Vec<f32>) -> CodeChunk {
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
    async fn test_upsert_fully_replaces_previous_chunks() {
        let (store, _dir) = test_store().await;

        let old: Vec<CodeChunk> = (0..3)
            .map(|i| make_chunk("app.py", &format!("old {}", i), vec![1.0, 0.0]))
            .collect();
        store.upsert_chunks("app.py", &old).await.unwrap();
        assert_eq!(store.chunk_count_for_file("app.py").await.unwrap(), 3);

        let new: Vec<CodeChunk> = (0..2)
            .map(|i| make_chunk("app.py", &format!("new {}", i), vec![1.0, 0.0]))
            .collect();
        store.upsert_chunks("app.py", &new).await.unwrap();
        assert_eq!(store.chunk_count_for_file("app.py").await.unwrap(), 2);

        // No stale content from the prior revision.
        let results = store.query(&[1.0, 0.0], 10, 0.0).await.unwrap();
        assert_eq!(results.len(), 2);
        for r in &results {
            assert!(r.chunk.content.starts_with("new"));
        }
    }

    #[tokio::test]
    async fn test_upsert_leaves_other_files_untouched() {
        let (store, _dir) = test_store().await;

        store
            .upsert_chunks("a.py", &[make_chunk("a.py", "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert_chunks("b.py", &[make_chunk("b.py", "beta", vec![0.0, 1.0])])
            .await
            .unwrap();

        store
            .upsert_chunks("a.py", &[make_chunk("a.py", "alpha2", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(store.chunk_count_for_file("b.py").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_file() {
        let (store, _dir) = test_store().await;

        store
            .upsert_chunks("a.py", &[make_chunk("a.py", "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(store.delete_file("a.py").await.unwrap(), 1);
        assert_eq!(store.chunk_count_for_file("a.py").await.unwrap(), 0);
        assert_eq!(store.delete_file("a.py").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_orders_by_score_and_respects_top_k() {
        let (store, _dir) = test_store().await;

        // Unit vectors at decreasing similarity to [1, 0].
        store
            .upsert_chunks(
                "a.py",
                &[
                    make_chunk("a.py", "exact", vec![1.0, 0.0]),
                    make_chunk("a.py", "close", vec![0.9, 0.4358899]),
                    make_chunk("a.py", "far", vec![0.5, 0.8660254]),
                ],
            )
            .await
            .unwrap();

        let results = store.query(&[1.0, 0.0], 2, 0.0).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.content, "exact");
        assert_eq!(results[1].chunk.content, "close");
        assert!(results[0].similarity_score >= results[1].similarity_score);
    }

    #[tokio::test]
    async fn test_query_threshold_filters() {
        let (store, _dir) = test_store().await;

        store
            .upsert_chunks(
                "a.py",
                &[
                    make_chunk("a.py", "exact", vec![1.0, 0.0]),
                    make_chunk("a.py", "orthogonal", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let results = store.query(&[1.0, 0.0], 10, 0.7).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.content, "exact");
        for r in &results {
            assert!(r.similarity_score >= 0.7);
        }
    }

    #[tokio::test]
    async fn test_query_tie_break_most_recent_first() {
        let (store, _dir) = test_store().await;

        let mut older = make_chunk("a.py", "older", vec![1.0, 0.0]);
        older.created_at = Utc::now() - Duration::seconds(60);
        let newer = make_chunk("b.py", "newer", vec![1.0, 0.0]);

        store.upsert_chunks("a.py", &[older]).await.unwrap();
        store.upsert_chunks("b.py", &[newer]).await.unwrap();

        let results = store.query(&[1.0, 0.0], 10, 0.0).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.content, "newer");
        assert_eq!(results[1].chunk.content, "older");
    }

    #[tokio::test]
    async fn test_query_empty_store_returns_empty() {
        let (store, _dir) = test_store().await;
        let results = store.query(&[1.0, 0.0], 5, 0.7).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_query_is_deterministic() {
        let (store, _dir) = test_store().await;

        store
            .upsert_chunks(
                "a.py",
                &[
                    make_chunk("a.py", "one", vec![0.8, 0.6]),
                    make_chunk("a.py", "two", vec![0.6, 0.8]),
                    make_chunk("a.py", "three", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let first = store.query(&[1.0, 0.0], 5, 0.0).await.unwrap();
        let second = store.query(&[1.0, 0.0], 5, 0.0).await.unwrap();
        let ids_first: Vec<&str> = first.iter().map(|r| r.chunk.id.as_str()).collect();
        let ids_second: Vec<&str> = second.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(ids_first, ids_second);
    }

    #[tokio::test]
    async fn test_ensure_model_rejects_mismatch() {
        let (store, _dir) = test_store().await;

        store.ensure_model("nomic-embed-text", 768).await.unwrap();
        store.ensure_model("nomic-embed-text", 768).await.unwrap();

        let err = store.ensure_model("all-minilm", 384).await.unwrap_err();
        assert!(matches!(err, Error::ModelMismatch { .. }));
    }

    #[tokio::test]
    async fn test_query_rejects_wrong_dims() {
        let (store, _dir) = test_store().await;
        store.ensure_model("nomic-embed-text", 2).await.unwrap();
        store
            .upsert_chunks("a.py", &[make_chunk("a.py", "x", vec![1.0, 0.0])])
            .await
            .unwrap();

        let err = store.query(&[1.0, 0.0, 0.0], 5, 0.0).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_suggestion_roundtrip() {
        let (store, _dir) = test_store().await;

        let suggestion = CodeSuggestion {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_id: "PROJ-42".to_string(),
            explanation: "adds retry handling".to_string(),
            confidence_score: 0.8,
            suggested_changes: vec![],
            similar_code_snippets: vec![],
            processing_time_ms: 120,
            model_used: "codellama".to_string(),
            created_at: Utc::now(),
        };
        store.insert_suggestion(&suggestion).await.unwrap();

        let recent = store.recent_suggestions(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].ticket_id, "PROJ-42");
        assert_eq!(recent[0].id, suggestion.id);
    }

    #[tokio::test]
    async fn test_stats() {
        let (store, _dir) = test_store().await;
        store.ensure_model("nomic-embed-text", 2).await.unwrap();
        store
            .upsert_chunks(
                "a.py",
                &[
                    make_chunk("a.py", "one", vec![1.0, 0.0]),
                    make_chunk("a.py", "two", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        store
            .upsert_chunks("b.py", &[make_chunk("b.py", "three", vec![1.0, 0.0])])
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.embedding_model.as_deref(), Some("nomic-embed-text"));
    }
}
