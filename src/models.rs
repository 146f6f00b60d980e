//! Core data models used throughout the suggestion pipeline.
//!
//! These types represent the chunks, vectorization runs, retrieval results,
//! and suggestions that flow through the write and read paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chunk produced by the chunker before embedding: a bounded span of a
/// source file's text with its 1-based inclusive line range.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
    /// Symbol name when the span aligns with a function/class boundary.
    pub function_name: Option<String>,
}

/// An embedded chunk as persisted in the vector store.
#[derive(Debug, Clone, Serialize)]
pub struct CodeChunk {
    pub id: String,
    pub file_path: String,
    pub language: String,
    pub function_name: Option<String>,
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// A single nearest-neighbor hit. Computed per query, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub chunk: CodeChunk,
    /// Cosine similarity mapped to [0, 1]; higher = more relevant.
    pub similarity_score: f32,
}

/// Terminal or in-flight state of a vectorization run.
///
/// Consumers must handle every variant explicitly; there is no catch-all
/// string status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VectorizationStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed { reason: String },
}

impl VectorizationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

/// Point-in-time view of a vectorization run, returned on status polls.
#[derive(Debug, Clone, Serialize)]
pub struct VectorizationSnapshot {
    pub run_id: Uuid,
    #[serde(flatten)]
    pub status: VectorizationStatus,
    pub total_files: u64,
    pub processed_files: u64,
    pub failed_files: u64,
    /// Append-only per-file outcome log, surfaced for diagnostics.
    pub details: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Kind of change a suggestion proposes for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
}

/// One proposed file change within a suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedChange {
    pub file_path: String,
    pub change_type: ChangeType,
    pub content: String,
}

/// Summary of a retrieved chunk attached to a suggestion as grounding
/// evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnippetRef {
    pub file_path: String,
    pub function_name: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
    pub similarity_score: f32,
    /// Leading portion of the chunk text, for display.
    pub excerpt: String,
}

/// A structured code-change proposal for one ticket. Immutable once
/// returned; optionally persisted for analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSuggestion {
    pub id: String,
    pub ticket_id: String,
    pub explanation: String,
    /// Combined retrieval-grounding and model self-report score in [0, 1].
    pub confidence_score: f32,
    pub suggested_changes: Vec<SuggestedChange>,
    pub similar_code_snippets: Vec<SnippetRef>,
    pub processing_time_ms: u64,
    pub model_used: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_tagged() {
        let json = serde_json::to_value(&VectorizationStatus::InProgress).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "in_progress" }));

        let json = serde_json::to_value(&VectorizationStatus::Failed {
            reason: "repository unreachable".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "repository unreachable");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!VectorizationStatus::NotStarted.is_terminal());
        assert!(!VectorizationStatus::InProgress.is_terminal());
        assert!(VectorizationStatus::Completed.is_terminal());
        assert!(VectorizationStatus::Failed {
            reason: String::new()
        }
        .is_terminal());
    }

    #[test]
    fn test_change_type_lowercase() {
        assert_eq!(
            serde_json::to_string(&ChangeType::Create).unwrap(),
            "\"create\""
        );
        assert_eq!(
            serde_json::to_string(&ChangeType::Modify).unwrap(),
            "\"modify\""
        );
    }
}
