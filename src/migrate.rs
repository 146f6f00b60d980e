//! Idempotent schema creation.

use sqlx::SqlitePool;

use crate::error::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Chunk records: one row per embedded chunk, keyed by file for the
    // per-file replace semantics of the store.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            language TEXT NOT NULL,
            function_name TEXT,
            content TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Index generation metadata: which embedding model produced the
    // stored vectors, and its dimensionality.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Generated suggestions, kept for analytics.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS suggestions (
            id TEXT PRIMARY KEY,
            ticket_id TEXT NOT NULL,
            explanation TEXT NOT NULL,
            confidence REAL NOT NULL,
            model TEXT NOT NULL,
            processing_ms INTEGER NOT NULL,
            payload_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_suggestions_created_at ON suggestions(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
