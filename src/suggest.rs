//! Suggestion assembly: ticket + retrieved chunks + completion → a
//! structured, scored code-change proposal.
//!
//! The assembler owns [`CodeSuggestion`] construction. It reads chunk data
//! only through the retriever, builds a generation prompt with the
//! retrieved chunks as grounding context (most similar first), parses the
//! completion into per-file changes, and derives a confidence score.
//!
//! # Confidence formula
//!
//! ```text
//! strength   = mean_similarity * (0.5 + 0.5 * hits / top_k)   (0 with no hits)
//! confidence = clamp(0.25 + 0.55 * strength + 0.20 * self_report, 0, 1)
//! ```
//!
//! where `self_report` is the model's own `CONFIDENCE:` line (0.5 when
//! absent). The score is monotonic in retrieval quality: more grounding
//! chunks and better similarity never lower it, all else equal.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{GenerationConfig, RetrievalConfig};
use crate::generation::{GenerationClient, GenerationRequest};
use crate::models::{
    ChangeType, CodeSuggestion, RetrievalResult, SnippetRef, SuggestedChange,
};
use crate::retrieve::Retriever;
use crate::store::VectorStore;
use crate::error::Result;

const EXCERPT_CHARS: usize = 160;

/// A suggestion request as received from the boundary layer.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TicketRequest {
    pub ticket_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Overrides the configured default generation model.
    #[serde(default)]
    pub model: Option<String>,
}

pub struct SuggestionAssembler {
    retriever: Retriever,
    generator: Arc<dyn GenerationClient>,
    store: VectorStore,
    retrieval: RetrievalConfig,
    generation: GenerationConfig,
}

impl SuggestionAssembler {
    pub fn new(
        retriever: Retriever,
        generator: Arc<dyn GenerationClient>,
        store: VectorStore,
        retrieval: RetrievalConfig,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            retriever,
            generator,
            store,
            retrieval,
            generation,
        }
    }

    /// Produce a [`CodeSuggestion`] for one ticket. One retrieval call and
    /// one generation call, in sequence; no partial results.
    pub async fn suggest(&self, request: &TicketRequest) -> Result<CodeSuggestion> {
        let started = Instant::now();
        let query_text = format!("{}\n\n{}", request.title, request.description);
        let query_text = query_text.trim().to_string();

        let results = self
            .retriever
            .retrieve(
                &query_text,
                self.retrieval.max_chunks_per_query,
                self.retrieval.similarity_threshold,
            )
            .await?;

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.generation.model.clone());

        let prompt = build_prompt(request, &query_text, &results);
        let completion = self
            .generator
            .complete(&GenerationRequest {
                model: model.clone(),
                prompt,
                temperature: self.generation.temperature,
                max_tokens: self.generation.max_tokens,
            })
            .await?;

        let parsed = parse_completion(&completion, &request.ticket_id);
        let confidence = confidence_score(
            &results,
            self.retrieval.max_chunks_per_query,
            parsed.self_report,
        );

        let explanation = if results.is_empty() {
            format!(
                "No similar code found in the vectorized repository; this suggestion is not grounded in existing code. {}",
                parsed.explanation
            )
            .trim_end()
            .to_string()
        } else {
            parsed.explanation
        };

        let suggestion = CodeSuggestion {
            id: Uuid::new_v4().to_string(),
            ticket_id: request.ticket_id.clone(),
            explanation,
            confidence_score: confidence,
            suggested_changes: parsed.changes,
            similar_code_snippets: results.iter().map(snippet_ref).collect(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            model_used: model,
            created_at: Utc::now(),
        };

        // Analytics record; the suggestion itself is the product.
        if let Err(e) = self.store.insert_suggestion(&suggestion).await {
            warn!(error = %e, "failed to persist suggestion");
        }

        info!(
            ticket = %suggestion.ticket_id,
            changes = suggestion.suggested_changes.len(),
            grounding = suggestion.similar_code_snippets.len(),
            confidence = suggestion.confidence_score,
            "suggestion assembled"
        );

        Ok(suggestion)
    }
}

fn snippet_ref(result: &RetrievalResult) -> SnippetRef {
    let excerpt: String = result.chunk.content.chars().take(EXCERPT_CHARS).collect();
    SnippetRef {
        file_path: result.chunk.file_path.clone(),
        function_name: result.chunk.function_name.clone(),
        start_line: result.chunk.start_line,
        end_line: result.chunk.end_line,
        similarity_score: result.similarity_score,
        excerpt,
    }
}

/// Grounding strength from the retrieval results, then a weighted blend
/// with the model's self-report. See the module docs for the formula.
fn confidence_score(results: &[RetrievalResult], top_k: usize, self_report: Option<f32>) -> f32 {
    let strength = if results.is_empty() {
        0.0
    } else {
        let mean: f32 = results
            .iter()
            .map(|r| r.similarity_score)
            .sum::<f32>()
            / results.len() as f32;
        let coverage = results.len() as f32 / top_k.max(1) as f32;
        mean * (0.5 + 0.5 * coverage)
    };

    let self_report = self_report.unwrap_or(0.5).clamp(0.0, 1.0);
    (0.25 + 0.55 * strength + 0.20 * self_report).clamp(0.0, 1.0)
}

fn build_prompt(request: &TicketRequest, query_text: &str, results: &[RetrievalResult]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are a senior engineer proposing a code change for the ticket below.\n\n",
    );
    prompt.push_str(&format!("Ticket {}:\n{}\n\n", request.ticket_id, query_text));

    if results.is_empty() {
        prompt.push_str("No similar code was found in the repository index.\n\n");
    } else {
        prompt.push_str("Relevant existing code, most similar first:\n\n");
        for result in results {
            let symbol = result
                .chunk
                .function_name
                .as_deref()
                .map(|n| format!(" ({})", n))
                .unwrap_or_default();
            prompt.push_str(&format!(
                "--- {} lines {}-{}{} [similarity {:.2}]\n```\n{}\n```\n\n",
                result.chunk.file_path,
                result.chunk.start_line,
                result.chunk.end_line,
                symbol,
                result.similarity_score,
                result.chunk.content
            ));
        }
    }

    prompt.push_str(
        "Respond with one or more change blocks in exactly this format:\n\
         FILE: <repository-relative path>\n\
         ACTION: <create|modify|delete>\n\
         ```\n<file content or changed section>\n```\n\
         Then finish with:\n\
         EXPLANATION: <why this change resolves the ticket>\n\
         CONFIDENCE: <your certainty, 0.0-1.0>\n",
    );

    prompt
}

struct ParsedCompletion {
    changes: Vec<SuggestedChange>,
    explanation: String,
    self_report: Option<f32>,
}

/// Parse the model's completion into structured changes. When the
/// response names no target file, fall back to a single `create` at a
/// derived module path so the caller always gets an actionable change.
fn parse_completion(completion: &str, ticket_id: &str) -> ParsedCompletion {
    let mut changes = Vec::new();
    let mut explanation_lines: Vec<String> = Vec::new();
    let mut self_report = None;

    let mut current_file: Option<String> = None;
    let mut current_action = ChangeType::Modify;
    let mut in_fence = false;
    let mut fence_buf = String::new();

    for line in completion.lines() {
        if in_fence {
            if line.trim_start().starts_with("```") {
                in_fence = false;
                if let Some(file) = current_file.take() {
                    changes.push(SuggestedChange {
                        file_path: file,
                        change_type: current_action,
                        content: fence_buf.trim_end().to_string(),
                    });
                }
                fence_buf.clear();
                current_action = ChangeType::Modify;
            } else {
                fence_buf.push_str(line);
                fence_buf.push('\n');
            }
            continue;
        }

        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("FILE:") {
            current_file = Some(rest.trim().to_string()).filter(|f| !f.is_empty());
        } else if let Some(rest) = trimmed.strip_prefix("ACTION:") {
            current_action = match rest.trim().to_lowercase().as_str() {
                "create" => ChangeType::Create,
                "delete" => ChangeType::Delete,
                _ => ChangeType::Modify,
            };
            // A delete needs no code block.
            if current_action == ChangeType::Delete {
                if let Some(file) = current_file.take() {
                    changes.push(SuggestedChange {
                        file_path: file,
                        change_type: ChangeType::Delete,
                        content: String::new(),
                    });
                    current_action = ChangeType::Modify;
                }
            }
        } else if trimmed.starts_with("```") {
            if current_file.is_some() {
                in_fence = true;
                fence_buf.clear();
            }
        } else if let Some(rest) = trimmed.strip_prefix("EXPLANATION:") {
            explanation_lines.push(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("CONFIDENCE:") {
            self_report = rest.trim().parse::<f32>().ok();
        } else if !explanation_lines.is_empty() && !trimmed.is_empty() {
            // Continuation of a multi-line explanation.
            explanation_lines.push(trimmed.to_string());
        }
    }

    if changes.is_empty() {
        changes.push(SuggestedChange {
            file_path: format!("modules/custom_module_{}.py", ticket_id.to_lowercase()),
            change_type: ChangeType::Create,
            content: strip_outer_fence(completion),
        });
    }

    let explanation = if explanation_lines.is_empty() {
        format!("Generated change proposal for ticket {}.", ticket_id)
    } else {
        explanation_lines.join(" ")
    };

    ParsedCompletion {
        changes,
        explanation,
        self_report,
    }
}

/// Remove a single outer code fence, if the whole completion is one.
fn strip_outer_fence(completion: &str) -> String {
    let trimmed = completion.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(inner) = rest.split_once('\n') {
            if let Some(body) = inner.1.strip_suffix("```") {
                return body.trim_end().to_string();
            }
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenerationConfig, RetrievalConfig};
    use crate::embedding::Embedder;
    use crate::error::Error;
    use crate::models::CodeChunk;
    use crate::{db, migrate};
    use async_trait::async_trait;

    fn result(score: f32) -> RetrievalResult {
        RetrievalResult {
            chunk: CodeChunk {
                id: Uuid::new_v4().to_string(),
                file_path: "a.py".to_string(),
                language: "python".to_string(),
                function_name: None,
                content: "def a(): pass".to_string(),
                start_line: 1,
                end_line: 1,
                embedding: vec![1.0, 0.0],
                created_at: Utc::now(),
            },
            similarity_score: score,
        }
    }

    #[test]
    fn test_confidence_zero_grounding_is_lowest() {
        let none = confidence_score(&[], 5, Some(0.8));
        let weak = confidence_score(&[result(0.7)], 5, Some(0.8));
        let strong = confidence_score(
            &[result(0.95), result(0.9), result(0.88), result(0.85), result(0.8)],
            5,
            Some(0.8),
        );
        assert!(none < weak);
        assert!(weak < strong);
    }

    #[test]
    fn test_confidence_monotonic_in_similarity() {
        let low = confidence_score(&[result(0.7), result(0.7)], 5, Some(0.5));
        let high = confidence_score(&[result(0.9), result(0.9)], 5, Some(0.5));
        assert!(high > low);
    }

    #[test]
    fn test_confidence_stays_in_unit_interval() {
        let c = confidence_score(
            &[result(1.0), result(1.0), result(1.0), result(1.0), result(1.0)],
            5,
            Some(1.0),
        );
        assert!(c <= 1.0);
        let c = confidence_score(&[], 5, Some(0.0));
        assert!(c >= 0.0);
    }

    #[test]
    fn test_parse_structured_completion() {
        let completion = "\
FILE: handlers/upload.py
ACTION: modify
```
def handle_upload(request):
    return save(request.files)
```
FILE: handlers/new.py
ACTION: create
```
def fresh(): pass
```
EXPLANATION: Routes uploads through the shared save helper.
CONFIDENCE: 0.85
";
        let parsed = parse_completion(completion, "PROJ-1");
        assert_eq!(parsed.changes.len(), 2);
        assert_eq!(parsed.changes[0].file_path, "handlers/upload.py");
        assert_eq!(parsed.changes[0].change_type, ChangeType::Modify);
        assert!(parsed.changes[0].content.contains("handle_upload"));
        assert_eq!(parsed.changes[1].change_type, ChangeType::Create);
        assert_eq!(
            parsed.explanation,
            "Routes uploads through the shared save helper."
        );
        assert_eq!(parsed.self_report, Some(0.85));
    }

    #[test]
    fn test_parse_delete_without_code_block() {
        let completion = "FILE: old/dead.py\nACTION: delete\nEXPLANATION: Removes dead module.\n";
        let parsed = parse_completion(completion, "PROJ-2");
        assert_eq!(parsed.changes.len(), 1);
        assert_eq!(parsed.changes[0].change_type, ChangeType::Delete);
        assert!(parsed.changes[0].content.is_empty());
    }

    #[test]
    fn test_parse_fallback_create_at_derived_path() {
        let completion = "```\ndef fix():\n    pass\n```";
        let parsed = parse_completion(completion, "PROJ-7");
        assert_eq!(parsed.changes.len(), 1);
        assert_eq!(parsed.changes[0].file_path, "modules/custom_module_proj-7.py");
        assert_eq!(parsed.changes[0].change_type, ChangeType::Create);
        assert_eq!(parsed.changes[0].content, "def fix():\n    pass");
    }

    // ---- end-to-end assembler tests with stub backends ----

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn model_name(&self) -> &str {
            "stub-model"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct StubGenerator {
        completion: Option<String>,
    }

    #[async_trait]
    impl GenerationClient for StubGenerator {
        async fn complete(&self, _request: &GenerationRequest) -> crate::error::Result<String> {
            self.completion
                .clone()
                .ok_or_else(|| Error::GenerationUnavailable("connection refused".to_string()))
        }
    }

    async fn assembler(
        seeded: bool,
        completion: Option<String>,
    ) -> (SuggestionAssembler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("test.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let store = VectorStore::new(pool);
        store.ensure_model("stub-model", 2).await.unwrap();

        if seeded {
            let chunk = CodeChunk {
                id: Uuid::new_v4().to_string(),
                file_path: "handlers/upload.py".to_string(),
                language: "python".to_string(),
                function_name: Some("handle_upload".to_string()),
                content: "def handle_upload(request):\n    pass".to_string(),
                start_line: 10,
                end_line: 12,
                embedding: vec![1.0, 0.0],
                created_at: Utc::now(),
            };
            store
                .upsert_chunks("handlers/upload.py", &[chunk])
                .await
                .unwrap();
        }

        let retriever = Retriever::new(store.clone(), Arc::new(StubEmbedder));
        let assembler = SuggestionAssembler::new(
            retriever,
            Arc::new(StubGenerator { completion }),
            store,
            RetrievalConfig::default(),
            GenerationConfig {
                base_url: "http://localhost:11434".to_string(),
                model: "codellama".to_string(),
                temperature: 0.2,
                max_tokens: 1024,
                timeout_secs: 120,
            },
        );
        (assembler, dir)
    }

    fn ticket() -> TicketRequest {
        TicketRequest {
            ticket_id: "PROJ-42".to_string(),
            title: "Fix file upload handling".to_string(),
            description: "Uploads larger than 1MB fail.".to_string(),
            model: None,
        }
    }

    #[tokio::test]
    async fn test_suggest_grounded() {
        let completion = "FILE: handlers/upload.py\nACTION: modify\n```\ndef handle_upload(request):\n    return stream(request)\n```\nEXPLANATION: Streams large uploads.\nCONFIDENCE: 0.9\n".to_string();
        let (assembler, _dir) = assembler(true, Some(completion)).await;

        let suggestion = assembler.suggest(&ticket()).await.unwrap();
        assert_eq!(suggestion.ticket_id, "PROJ-42");
        assert_eq!(suggestion.suggested_changes.len(), 1);
        assert_eq!(suggestion.similar_code_snippets.len(), 1);
        assert_eq!(
            suggestion.similar_code_snippets[0].function_name.as_deref(),
            Some("handle_upload")
        );
        assert_eq!(suggestion.model_used, "codellama");
        assert!(suggestion.explanation.contains("Streams large uploads."));
    }

    #[tokio::test]
    async fn test_suggest_without_grounding_flags_it() {
        let completion = "```\ndef fix(): pass\n```\nEXPLANATION: Best guess.\nCONFIDENCE: 0.9\n";
        let (grounded, _d1) = assembler(true, Some(completion.to_string())).await;
        let (ungrounded, _d2) = assembler(false, Some(completion.to_string())).await;

        let with = grounded.suggest(&ticket()).await.unwrap();
        let without = ungrounded.suggest(&ticket()).await.unwrap();

        assert!(without.explanation.contains("No similar code found"));
        assert!(without.similar_code_snippets.is_empty());
        assert!(without.confidence_score < with.confidence_score);
        // Still an actionable suggestion.
        assert_eq!(without.suggested_changes.len(), 1);
        assert_eq!(without.suggested_changes[0].change_type, ChangeType::Create);
    }

    #[tokio::test]
    async fn test_generation_failure_propagates() {
        let (assembler, _dir) = assembler(true, None).await;
        let err = assembler.suggest(&ticket()).await.unwrap_err();
        assert!(matches!(err, Error::GenerationUnavailable(_)));
    }

    #[tokio::test]
    async fn test_suggestion_is_persisted() {
        let completion = "EXPLANATION: noted.\n".to_string();
        let (assembler, _dir) = assembler(true, Some(completion)).await;

        let suggestion = assembler.suggest(&ticket()).await.unwrap();
        let recent = assembler.store.recent_suggestions(5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, suggestion.id);
    }
}
