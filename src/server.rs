//! JSON HTTP API.
//!
//! Exposes the vectorization and suggestion pipeline over HTTP for a
//! frontend or ticket-system integration to call.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/vectorize` | Start a background vectorization run (202) |
//! | `GET`  | `/api/vectorize/status` | Snapshot of the latest run |
//! | `GET`  | `/api/vectorize/status/{run_id}` | Snapshot of a specific run |
//! | `POST` | `/api/vectorize/{run_id}/cancel` | Request cancellation |
//! | `POST` | `/api/search` | Similarity search over stored chunks |
//! | `POST` | `/api/suggest` | Generate a grounded change suggestion |
//! | `GET`  | `/api/suggestions` | Recently persisted suggestions |
//! | `GET`  | `/api/stats` | Index statistics |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "validation", "message": "query must not be empty" } }
//! ```
//!
//! Status mapping: configuration and validation errors → 400, unknown run →
//! 404, concurrent run or model mismatch → 409, unreachable embedding or
//! generation backend → 502, everything else → 500.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser frontends can
//! call the API directly.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::embedding::OllamaEmbedder;
use crate::error::Error;
use crate::generation::OllamaGenerator;
use crate::migrate;
use crate::models::{CodeSuggestion, RetrievalResult, VectorizationSnapshot};
use crate::repo::FilesystemRepo;
use crate::retrieve::Retriever;
use crate::store::{StoreStats, VectorStore};
use crate::suggest::{SuggestionAssembler, TicketRequest};
use crate::vectorize::Orchestrator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: VectorStore,
    orchestrator: Arc<Orchestrator>,
    retriever: Arc<Retriever>,
    assembler: Arc<SuggestionAssembler>,
}

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;
    let store = VectorStore::new(pool);

    let embedder = Arc::new(OllamaEmbedder::new(&config.embedding)?);
    let generator = Arc::new(OllamaGenerator::new(&config.generation)?);
    let repo = Arc::new(FilesystemRepo::new(&config.repository)?);

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        embedder.clone(),
        repo,
        config.chunking.clone(),
        config.vectorize.concurrency,
    ));
    let retriever = Arc::new(Retriever::new(store.clone(), embedder.clone()));
    let assembler = Arc::new(SuggestionAssembler::new(
        Retriever::new(store.clone(), embedder),
        generator,
        store.clone(),
        config.retrieval.clone(),
        config.generation.clone(),
    ));

    let state = AppState {
        config,
        store,
        orchestrator,
        retriever,
        assembler,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    info!(addr = %bind_addr, "server listening");
    println!("API server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/vectorize", post(handle_vectorize))
        .route("/api/vectorize/status", get(handle_latest_status))
        .route("/api/vectorize/status/{run_id}", get(handle_run_status))
        .route("/api/vectorize/{run_id}/cancel", post(handle_cancel))
        .route("/api/search", post(handle_search))
        .route("/api/suggest", post(handle_suggest))
        .route("/api/suggestions", get(handle_suggestions))
        .route("/api/stats", get(handle_stats))
        .with_state(state)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"validation"`, `"model_mismatch"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::ConfigurationMissing(_) => (StatusCode::BAD_REQUEST, "configuration_missing"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            Error::RunNotFound(_) => (StatusCode::NOT_FOUND, "run_not_found"),
            Error::RunAlreadyInProgress(_) => (StatusCode::CONFLICT, "run_in_progress"),
            Error::ModelMismatch { .. } => (StatusCode::CONFLICT, "model_mismatch"),
            Error::BackendUnreachable { .. } => (StatusCode::BAD_GATEWAY, "backend_unreachable"),
            Error::EmbeddingUnavailable(_) => (StatusCode::BAD_GATEWAY, "embedding_unavailable"),
            Error::GenerationUnavailable(_) => (StatusCode::BAD_GATEWAY, "generation_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "validation",
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Health check used by load balancers and monitoring.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/vectorize ============

#[derive(Serialize)]
struct VectorizeAccepted {
    run_id: Uuid,
}

/// Starts a background vectorization run.
///
/// Returns `202 Accepted` with the new run id, or `409 Conflict` if a run
/// is already in progress.
async fn handle_vectorize(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<VectorizeAccepted>), AppError> {
    let run_id = state.orchestrator.start()?;
    Ok((StatusCode::ACCEPTED, Json(VectorizeAccepted { run_id })))
}

// ============ GET /api/vectorize/status ============

/// Snapshot of the most recent run, or `404` if no run was ever started.
async fn handle_latest_status(
    State(state): State<AppState>,
) -> Result<Json<VectorizationSnapshot>, AppError> {
    let snapshot = state.orchestrator.latest_snapshot().ok_or(AppError {
        status: StatusCode::NOT_FOUND,
        code: "run_not_found",
        message: "no vectorization run has been started".to_string(),
    })?;
    Ok(Json(snapshot))
}

/// Snapshot of a specific run by id.
async fn handle_run_status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<VectorizationSnapshot>, AppError> {
    let run_id = parse_run_id(&run_id)?;
    Ok(Json(state.orchestrator.snapshot(run_id)?))
}

/// Requests cancellation of a running vectorization.
async fn handle_cancel(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let run_id = parse_run_id(&run_id)?;
    state.orchestrator.cancel(run_id)?;
    Ok(StatusCode::ACCEPTED)
}

fn parse_run_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid run id: {}", raw)))
}

// ============ POST /api/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    threshold: Option<f32>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<RetrievalResult>,
}

/// Similarity search over the stored chunks. `top_k` and `threshold`
/// default to the configured retrieval settings.
async fn handle_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let top_k = request
        .top_k
        .unwrap_or(state.config.retrieval.max_chunks_per_query);
    let threshold = request
        .threshold
        .unwrap_or(state.config.retrieval.similarity_threshold);

    let results = state.retriever.retrieve(&request.query, top_k, threshold).await?;
    Ok(Json(SearchResponse {
        query: request.query,
        results,
    }))
}

// ============ POST /api/suggest ============

/// Generates a change suggestion for a ticket, grounded in retrieved code.
async fn handle_suggest(
    State(state): State<AppState>,
    Json(request): Json<TicketRequest>,
) -> Result<Json<CodeSuggestion>, AppError> {
    if request.ticket_id.trim().is_empty() {
        return Err(bad_request("ticket_id must not be empty"));
    }
    if request.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }
    let suggestion = state.assembler.suggest(&request).await?;
    Ok(Json(suggestion))
}

// ============ GET /api/suggestions ============

#[derive(Serialize)]
struct SuggestionsResponse {
    suggestions: Vec<CodeSuggestion>,
}

/// Most recent persisted suggestions, newest first.
async fn handle_suggestions(
    State(state): State<AppState>,
) -> Result<Json<SuggestionsResponse>, AppError> {
    let suggestions = state.store.recent_suggestions(50).await?;
    Ok(Json(SuggestionsResponse { suggestions }))
}

// ============ GET /api/stats ============

/// Index statistics: chunk count, file count, and the embedding model the
/// index was built with.
async fn handle_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, AppError> {
    Ok(Json(state.store.stats().await?))
}
