//! Vectorization orchestration.
//!
//! Walks a repository snapshot, chunks and embeds each eligible file, and
//! writes the results to the vector store. Runs execute as background
//! tasks identified by a run id; callers poll
//! [`Orchestrator::snapshot`] for progress instead of subscribing to any
//! push mechanism.
//!
//! Run semantics:
//! - at most one run is active at a time; a second start request is
//!   rejected with `RunAlreadyInProgress`
//! - a single file's failure (unreadable content, embedding error) is
//!   recorded in the run's `details` and never aborts the run
//! - `processed_files` counts every attempt, so `processed_files ==
//!   total_files` means the walk finished
//! - a run ends `failed` only on a run-level fault (repository or store
//!   unreachable) or cancellation; files already upserted stay committed

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunker::{chunk_text, language_from_path};
use crate::config::ChunkingConfig;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::models::{CodeChunk, VectorizationSnapshot, VectorizationStatus};
use crate::repo::RepositorySource;
use crate::store::VectorStore;

/// Mutable state of one vectorization run, behind a shared handle.
struct RunState {
    run_id: Uuid,
    status: VectorizationStatus,
    total_files: u64,
    processed_files: u64,
    failed_files: u64,
    details: Vec<String>,
    started_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    cancelled: bool,
}

impl RunState {
    fn new(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            status: VectorizationStatus::NotStarted,
            total_files: 0,
            processed_files: 0,
            failed_files: 0,
            details: Vec::new(),
            started_at: now,
            last_updated: now,
            cancelled: false,
        }
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    fn snapshot(&self) -> VectorizationSnapshot {
        VectorizationSnapshot {
            run_id: self.run_id,
            status: self.status.clone(),
            total_files: self.total_files,
            processed_files: self.processed_files,
            failed_files: self.failed_files,
            details: self.details.clone(),
            started_at: self.started_at,
            last_updated: self.last_updated,
        }
    }
}

type RunHandle = Arc<Mutex<RunState>>;

#[derive(Default)]
struct Registry {
    runs: HashMap<Uuid, RunHandle>,
    active: Option<Uuid>,
    latest: Option<Uuid>,
}

pub struct Orchestrator {
    registry: Mutex<Registry>,
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    repo: Arc<dyn RepositorySource>,
    chunking: ChunkingConfig,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(
        store: VectorStore,
        embedder: Arc<dyn Embedder>,
        repo: Arc<dyn RepositorySource>,
        chunking: ChunkingConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            store,
            embedder,
            repo,
            chunking,
            concurrency: concurrency.max(1),
        }
    }

    /// Start a background vectorization run and return its id.
    ///
    /// Rejected with [`Error::RunAlreadyInProgress`] while another run is
    /// active, so two writers can never race on the same file's chunk
    /// set.
    pub fn start(self: &Arc<Self>) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        let handle: RunHandle = Arc::new(Mutex::new(RunState::new(run_id)));

        {
            let mut registry = self.registry.lock().expect("registry poisoned");
            // The active slot is cleared by the background task after the
            // terminal status is published, so check the status too.
            if let Some(active_id) = registry.active {
                let still_running = registry
                    .runs
                    .get(&active_id)
                    .map(|h| !h.lock().expect("run poisoned").status.is_terminal())
                    .unwrap_or(false);
                if still_running {
                    return Err(Error::RunAlreadyInProgress(active_id));
                }
            }
            registry.runs.insert(run_id, handle.clone());
            registry.active = Some(run_id);
            registry.latest = Some(run_id);
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.execute(run_id, handle).await;
        });

        Ok(run_id)
    }

    /// Point-in-time view of a run.
    pub fn snapshot(&self, run_id: Uuid) -> Result<VectorizationSnapshot> {
        let registry = self.registry.lock().expect("registry poisoned");
        let handle = registry
            .runs
            .get(&run_id)
            .ok_or(Error::RunNotFound(run_id))?
            .clone();
        drop(registry);
        let snapshot = handle.lock().expect("run poisoned").snapshot();
        Ok(snapshot)
    }

    /// Snapshot of the most recently started run, if any.
    pub fn latest_snapshot(&self) -> Option<VectorizationSnapshot> {
        let registry = self.registry.lock().expect("registry poisoned");
        let latest = registry.latest?;
        let handle = registry.runs.get(&latest)?.clone();
        drop(registry);
        let snapshot = handle.lock().expect("run poisoned").snapshot();
        Some(snapshot)
    }

    /// Request cancellation. Files already upserted remain committed;
    /// in-flight files finish their atomic upsert; pending files are
    /// abandoned.
    pub fn cancel(&self, run_id: Uuid) -> Result<()> {
        let registry = self.registry.lock().expect("registry poisoned");
        let handle = registry
            .runs
            .get(&run_id)
            .ok_or(Error::RunNotFound(run_id))?;
        let mut run = handle.lock().expect("run poisoned");
        run.cancelled = true;
        run.touch();
        Ok(())
    }

    /// Poll a run until it reaches a terminal state. Used by the CLI's
    /// foreground `vectorize` command and by tests.
    pub async fn wait(&self, run_id: Uuid) -> Result<VectorizationSnapshot> {
        loop {
            let snapshot = self.snapshot(run_id)?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn execute(self: Arc<Self>, run_id: Uuid, handle: RunHandle) {
        match self.run_walk(&handle).await {
            Ok(()) => {}
            Err(e) => {
                warn!(%run_id, error = %e, "vectorization run failed");
                let mut run = handle.lock().expect("run poisoned");
                run.status = VectorizationStatus::Failed {
                    reason: e.to_string(),
                };
                run.details.push(format!("run failed: {}", e));
                run.touch();
            }
        }

        let mut registry = self.registry.lock().expect("registry poisoned");
        if registry.active == Some(run_id) {
            registry.active = None;
        }
    }

    async fn run_walk(&self, handle: &RunHandle) -> Result<()> {
        // Run-level preconditions: store tagged with our model, repository
        // reachable. Failures here fail the whole run.
        self.store
            .ensure_model(self.embedder.model_name(), self.embedder.dims())
            .await?;
        let files = self.repo.list_files()?;

        {
            let mut run = handle.lock().expect("run poisoned");
            run.total_files = files.len() as u64;
            run.status = VectorizationStatus::InProgress;
            run.details
                .push(format!("vectorization started: {} files", files.len()));
            run.touch();
        }
        info!(files = files.len(), "vectorization run started");

        let listed: HashSet<String> = files.iter().cloned().collect();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut cancelled = false;

        for path in files {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");

            if handle.lock().expect("run poisoned").cancelled {
                drop(permit);
                cancelled = true;
                break;
            }

            let repo = Arc::clone(&self.repo);
            let embedder = Arc::clone(&self.embedder);
            let store = self.store.clone();
            let chunking = self.chunking.clone();
            let handle = Arc::clone(handle);

            workers.spawn(async move {
                let _permit = permit;
                let outcome = process_file(&path, repo, embedder, store, &chunking).await;

                let mut run = handle.lock().expect("run poisoned");
                run.processed_files += 1;
                match outcome {
                    Ok(chunks) => {
                        info!(file = %path, chunks, "file vectorized");
                    }
                    Err(message) => {
                        run.failed_files += 1;
                        run.details.push(format!("{}: {}", path, message));
                        warn!(file = %path, error = %message, "file skipped");
                    }
                }
                run.touch();
            });
        }

        while workers.join_next().await.is_some() {}

        // Files that left the repository since the last run lose their
        // chunks. Skipped on cancellation so a partial walk never prunes.
        if !cancelled {
            for stale in self.store.indexed_files().await? {
                if !listed.contains(&stale) {
                    let removed = self.store.delete_file(&stale).await?;
                    info!(file = %stale, removed, "pruned chunks for removed file");
                    handle
                        .lock()
                        .expect("run poisoned")
                        .details
                        .push(format!("{}: removed from repository, chunks pruned", stale));
                }
            }
        }

        let mut run = handle.lock().expect("run poisoned");
        if cancelled {
            run.status = VectorizationStatus::Failed {
                reason: "cancelled".to_string(),
            };
            let detail = format!(
                "vectorization cancelled: {} of {} files processed",
                run.processed_files, run.total_files
            );
            run.details.push(detail);
        } else {
            run.status = VectorizationStatus::Completed;
            let detail = format!(
                "vectorization completed: {} processed, {} failed",
                run.processed_files, run.failed_files
            );
            run.details.push(detail);
        }
        run.touch();
        info!(
            processed = run.processed_files,
            failed = run.failed_files,
            cancelled,
            "vectorization run finished"
        );

        Ok(())
    }
}

/// Read, chunk, embed, and store one file. Returns the number of chunks
/// written, or a diagnostic message for the run log.
async fn process_file(
    path: &str,
    repo: Arc<dyn RepositorySource>,
    embedder: Arc<dyn Embedder>,
    store: VectorStore,
    chunking: &ChunkingConfig,
) -> std::result::Result<usize, String> {
    let text = repo
        .read_file(path)
        .map_err(|e| format!("read failed: {}", e))?;

    let language = language_from_path(path);
    let spans = chunk_text(&text, language, chunking.chunk_size, chunking.chunk_overlap);

    // Zero candidates (empty file) is not an error, but the replace
    // semantics still apply: any chunks from a prior revision go away.
    let texts: Vec<String> = spans.iter().map(|s| s.content.clone()).collect();
    let vectors = embedder
        .embed_batch(&texts)
        .await
        .map_err(|e| format!("embedding failed: {}", e))?;

    let created_at = Utc::now();
    let chunks: Vec<CodeChunk> = spans
        .into_iter()
        .zip(vectors)
        .map(|(span, embedding)| CodeChunk {
            id: Uuid::new_v4().to_string(),
            file_path: path.to_string(),
            language: language.to_string(),
            function_name: span.function_name,
            content: span.content,
            start_line: span.start_line,
            end_line: span.end_line,
            embedding,
            created_at,
        })
        .collect();

    let count = chunks.len();
    store
        .upsert_chunks(path, &chunks)
        .await
        .map_err(|e| format!("store write failed: {}", e))?;

    Ok(count)
}
