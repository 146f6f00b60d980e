//! Language-model generation backend.
//!
//! A thin client over an Ollama-compatible `/api/generate` endpoint.
//! Generation is the primary synchronous user action, so failures are not
//! silently retried; they surface as
//! [`Error::GenerationUnavailable`] for the caller to render.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// Parameters for one completion call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Prompt-in, completion-out interface to the generation backend.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn complete(&self, request: &GenerationRequest) -> Result<String>;
}

/// Client for an Ollama-compatible generate endpoint.
pub struct OllamaGenerator {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::GenerationUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Probe the backend and list the models it has loaded.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TagsResponse {
            models: Vec<ModelInfo>,
        }
        #[derive(Deserialize)]
        struct ModelInfo {
            name: String,
        }

        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::BackendUnreachable {
                service: "generation",
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::BackendUnreachable {
                service: "generation",
                message: format!("HTTP {}", response.status()),
            });
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| Error::GenerationUnavailable(format!("invalid tags response: {}", e)))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[async_trait]
impl GenerationClient for OllamaGenerator {
    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::GenerationUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::GenerationUnavailable(format!(
                "HTTP {}: {}",
                status, text
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::GenerationUnavailable(format!("invalid response: {}", e)))?;

        Ok(parsed.response)
    }
}
