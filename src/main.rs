//! # RagPatch CLI (`ragpatch`)
//!
//! The `ragpatch` binary drives the vectorization and suggestion pipeline
//! from the command line and starts the HTTP API server.
//!
//! ## Usage
//!
//! ```bash
//! ragpatch --config ./config/ragpatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragpatch init` | Create the SQLite database and run schema migrations |
//! | `ragpatch check` | Probe the repository, embedding, and generation backends |
//! | `ragpatch vectorize` | Index the configured repository (runs to completion) |
//! | `ragpatch status` | Show index statistics |
//! | `ragpatch search "<query>"` | Similarity search over stored chunks |
//! | `ragpatch suggest` | Generate a grounded change suggestion for a ticket |
//! | `ragpatch suggestions` | List recently persisted suggestions |
//! | `ragpatch serve` | Start the JSON HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! ragpatch init --config ./config/ragpatch.toml
//!
//! # Index the repository
//! ragpatch vectorize --config ./config/ragpatch.toml
//!
//! # Search for similar code
//! ragpatch search "file upload handling" --top-k 5
//!
//! # Draft a change for a ticket
//! ragpatch suggest --ticket PROJ-42 --title "Add upload size limit" \
//!     --description "Reject uploads larger than 10 MB"
//!
//! # Start the HTTP API
//! ragpatch serve --config ./config/ragpatch.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use ragpatch::config::{self, Config};
use ragpatch::embedding::{Embedder, OllamaEmbedder};
use ragpatch::generation::OllamaGenerator;
use ragpatch::models::VectorizationStatus;
use ragpatch::repo::{FilesystemRepo, RepositorySource};
use ragpatch::retrieve::Retriever;
use ragpatch::store::VectorStore;
use ragpatch::suggest::{SuggestionAssembler, TicketRequest};
use ragpatch::vectorize::Orchestrator;
use ragpatch::{db, migrate, server};

/// RagPatch — repository-grounded code-change suggestions for tickets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ragpatch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ragpatch",
    about = "RagPatch — repository-grounded code-change suggestions for tickets",
    version,
    long_about = "RagPatch vectorizes a code repository (walk, chunk, embed, store), keeps the \
    index in SQLite, and generates code-change suggestions for tickets grounded in the most \
    similar existing code."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ragpatch.toml`. Repository, database,
    /// embedding, generation, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/ragpatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (chunks,
    /// index_meta, suggestions). Idempotent — running it again is safe.
    Init,

    /// Probe the configured backends.
    ///
    /// Verifies that the repository root is readable, the embedding
    /// backend answers, and the generation backend lists its models.
    /// Useful before the first `vectorize`.
    Check,

    /// Vectorize the configured repository.
    ///
    /// Walks the repository, chunks and embeds every eligible file, and
    /// replaces each file's chunks in the store. Prints progress and runs
    /// to completion. Files that fail to read or embed are reported and
    /// skipped.
    Vectorize,

    /// Show index statistics.
    ///
    /// Prints chunk and file counts and the embedding model the index
    /// was built with.
    Status,

    /// Similarity search over stored chunks.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum similarity score in [0, 1].
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Generate a grounded change suggestion for a ticket.
    ///
    /// Retrieves the most similar stored chunks for the ticket text and
    /// asks the generation backend for a change proposal grounded in
    /// them. The suggestion is printed and persisted.
    Suggest {
        /// Ticket identifier (e.g., `PROJ-42`).
        #[arg(long)]
        ticket: String,

        /// Ticket title.
        #[arg(long)]
        title: String,

        /// Ticket description.
        #[arg(long, default_value = "")]
        description: String,

        /// Override the configured generation model.
        #[arg(long)]
        model: Option<String>,
    },

    /// List recently persisted suggestions.
    Suggestions,

    /// Start the JSON HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// vectorize, search, and suggest endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Check => {
            run_check(&cfg).await?;
        }
        Commands::Vectorize => {
            run_vectorize(&cfg).await?;
        }
        Commands::Status => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let stats = VectorStore::new(pool).stats().await?;
            println!("Chunks:          {}", stats.chunk_count);
            println!("Files:           {}", stats.file_count);
            println!(
                "Embedding model: {}",
                stats.embedding_model.as_deref().unwrap_or("(not indexed)")
            );
        }
        Commands::Search {
            query,
            top_k,
            threshold,
        } => {
            run_search(&cfg, &query, top_k, threshold).await?;
        }
        Commands::Suggest {
            ticket,
            title,
            description,
            model,
        } => {
            run_suggest(&cfg, ticket, title, description, model).await?;
        }
        Commands::Suggestions => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let suggestions = VectorStore::new(pool).recent_suggestions(20).await?;
            if suggestions.is_empty() {
                println!("No suggestions recorded.");
            }
            for s in suggestions {
                println!(
                    "{}  {}  confidence {:.2}  model {}  {}",
                    s.created_at.format("%Y-%m-%d %H:%M"),
                    s.ticket_id,
                    s.confidence_score,
                    s.model_used,
                    s.id
                );
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

/// Probe the repository and both model backends, reporting each result.
async fn run_check(cfg: &Config) -> anyhow::Result<()> {
    let mut failures = 0;

    match FilesystemRepo::new(&cfg.repository).and_then(|r| r.list_files()) {
        Ok(files) => println!(
            "repository: ok ({} eligible files under {})",
            files.len(),
            cfg.repository.root.display()
        ),
        Err(e) => {
            failures += 1;
            println!("repository: FAILED ({})", e);
        }
    }

    let embedder = OllamaEmbedder::new(&cfg.embedding)?;
    match embedder.embed("health check probe").await {
        Ok(v) => println!(
            "embedding:  ok (model {}, {} dims)",
            cfg.embedding.model,
            v.len()
        ),
        Err(e) => {
            failures += 1;
            println!("embedding:  FAILED ({})", e);
        }
    }

    let generator = OllamaGenerator::new(&cfg.generation)?;
    match generator.list_models().await {
        Ok(models) => {
            let loaded = models.iter().any(|m| m.starts_with(&cfg.generation.model));
            println!(
                "generation: ok ({} models available{})",
                models.len(),
                if loaded {
                    String::new()
                } else {
                    format!("; configured model {} not loaded", cfg.generation.model)
                }
            );
        }
        Err(e) => {
            failures += 1;
            println!("generation: FAILED ({})", e);
        }
    }

    if failures > 0 {
        anyhow::bail!("{} backend check(s) failed", failures);
    }
    Ok(())
}

/// Run a vectorization to completion, printing progress as it goes.
async fn run_vectorize(cfg: &Config) -> anyhow::Result<()> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    let store = VectorStore::new(pool);

    let embedder = Arc::new(OllamaEmbedder::new(&cfg.embedding)?);
    let repo = Arc::new(FilesystemRepo::new(&cfg.repository)?);
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        embedder,
        repo,
        cfg.chunking.clone(),
        cfg.vectorize.concurrency,
    ));

    let run_id = orchestrator.start()?;
    println!("Vectorization run {} started.", run_id);

    let mut last_processed = 0;
    let snapshot = loop {
        let snapshot = orchestrator.snapshot(run_id)?;
        if snapshot.processed_files != last_processed {
            last_processed = snapshot.processed_files;
            println!(
                "  {}/{} files ({} failed)",
                snapshot.processed_files, snapshot.total_files, snapshot.failed_files
            );
        }
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    match &snapshot.status {
        VectorizationStatus::Completed => {
            println!(
                "Completed: {} files processed, {} failed.",
                snapshot.processed_files, snapshot.failed_files
            );
            for line in snapshot
                .details
                .iter()
                .filter(|l| !l.starts_with("vectorization"))
            {
                println!("  skipped {}", line);
            }
        }
        VectorizationStatus::Failed { reason } => {
            anyhow::bail!("vectorization failed: {}", reason);
        }
        _ => {}
    }
    Ok(())
}

async fn run_search(
    cfg: &Config,
    query: &str,
    top_k: Option<usize>,
    threshold: Option<f32>,
) -> anyhow::Result<()> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    let store = VectorStore::new(pool);
    let embedder = Arc::new(OllamaEmbedder::new(&cfg.embedding)?);
    let retriever = Retriever::new(store, embedder);

    let results = retriever
        .retrieve(
            query,
            top_k.unwrap_or(cfg.retrieval.max_chunks_per_query),
            threshold.unwrap_or(cfg.retrieval.similarity_threshold),
        )
        .await?;

    if results.is_empty() {
        println!("No similar code found.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        let symbol = r.chunk.function_name.as_deref().unwrap_or("-");
        println!(
            "{}. {} lines {}-{}  {}  score {:.3}",
            i + 1,
            r.chunk.file_path,
            r.chunk.start_line,
            r.chunk.end_line,
            symbol,
            r.similarity_score
        );
        for line in r.chunk.content.lines().take(3) {
            println!("     {}", line);
        }
    }
    Ok(())
}

async fn run_suggest(
    cfg: &Config,
    ticket: String,
    title: String,
    description: String,
    model: Option<String>,
) -> anyhow::Result<()> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    let store = VectorStore::new(pool);
    let embedder = Arc::new(OllamaEmbedder::new(&cfg.embedding)?);
    let generator = Arc::new(OllamaGenerator::new(&cfg.generation)?);
    let assembler = SuggestionAssembler::new(
        Retriever::new(store.clone(), embedder),
        generator,
        store,
        cfg.retrieval.clone(),
        cfg.generation.clone(),
    );

    let request = TicketRequest {
        ticket_id: ticket,
        title,
        description,
        model,
    };
    let suggestion = assembler.suggest(&request).await?;

    println!("Suggestion {} for {}", suggestion.id, suggestion.ticket_id);
    println!(
        "Confidence {:.2}  model {}  {} ms",
        suggestion.confidence_score, suggestion.model_used, suggestion.processing_time_ms
    );
    println!();
    println!("{}", suggestion.explanation);
    for change in &suggestion.suggested_changes {
        println!();
        println!("--- {:?} {}", change.change_type, change.file_path);
        println!("{}", change.content);
    }
    if !suggestion.similar_code_snippets.is_empty() {
        println!();
        println!("Grounded in:");
        for s in &suggestion.similar_code_snippets {
            println!(
                "  {} lines {}-{}  score {:.3}",
                s.file_path, s.start_line, s.end_line, s.similarity_score
            );
        }
    }
    Ok(())
}
