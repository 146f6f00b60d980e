//! # RagPatch
//!
//! Repository-grounded code-change suggestions for ticket workflows.
//!
//! RagPatch vectorizes a code repository (walk, chunk, embed, store),
//! keeps the resulting index in SQLite, and answers two kinds of queries
//! against it: similarity search over stored chunks, and full change
//! suggestions where a language model drafts file edits grounded in the
//! retrieved code.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Repository │──▶│ Vectorizer    │──▶│  SQLite   │
//! │  (files)   │   │ Chunk+Embed  │   │  chunks   │
//! └────────────┘   └──────────────┘   └────┬─────┘
//!                                          │
//!                      ┌───────────────────┤
//!                      ▼                   ▼
//!                ┌───────────┐       ┌───────────┐
//!                │ Retriever │──────▶│ Suggestion │
//!                │ (search)  │       │ Assembler │
//!                └───────────┘       └─────┬─────┘
//!                                          ▼
//!                                   ┌───────────┐
//!                                   │  Ollama   │
//!                                   │ generate  │
//!                                   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragpatch init                  # create database
//! ragpatch vectorize             # index the configured repository
//! ragpatch search "file upload"  # similarity search
//! ragpatch suggest --ticket PROJ-42 --title "Add upload size limit"
//! ragpatch serve                 # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`repo`] | Repository file access |
//! | [`chunker`] | Structure-aware text chunking |
//! | [`embedding`] | Embedding backend and vector math |
//! | [`store`] | SQLite vector store |
//! | [`vectorize`] | Background vectorization runs |
//! | [`retrieve`] | Similarity retrieval |
//! | [`generation`] | Language-model generation backend |
//! | [`suggest`] | Suggestion assembly |
//! | [`server`] | JSON HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod migrate;
pub mod models;
pub mod repo;
pub mod retrieve;
pub mod server;
pub mod store;
pub mod suggest;
pub mod vectorize;

pub use error::{Error, Result};
