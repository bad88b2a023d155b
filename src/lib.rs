//! # Convo Store
//!
//! Relational persistence for conversational agents: threads, their
//! messages, per-resource working memory, workflow run snapshots, and the
//! traces and evals recorded while agents run.
//!
//! ## Features
//!
//! - **Threads**: create, rename, list per resource, cascade delete
//! - **Messages**: upsert in batches, sparse patches with content merging,
//!   recent-message reads with context windows around anchor messages
//! - **Resources**: working memory text and metadata per resource
//! - **Workflow runs**: snapshot upserts keyed by `(workflow_name, run_id)`
//! - **Traces & evals**: filtered, paginated observability reads
//! - **Named schemas**: tables can live in an attached schema database
//!
//! ## Architecture
//!
//! ```text
//! Caller → Store traits (ThreadStore, MessageStore, ...)
//!                    ↓
//!              SqliteStore → SQLite (sqlx pool)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use convo_store::{Config, SqliteStore, ThreadStore};
//! use convo_store::storage::Thread;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let store = SqliteStore::new(&config.database).await?;
//!     store.init().await?;
//!
//!     let thread = store.save_thread(&Thread::new("user-1", "Support chat")).await?;
//!     println!("saved {}", thread.id);
//!     Ok(())
//! }
//! ```

/// Configuration loaded from the environment.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult, ErrorCategory, StorageError, StorageResult};
pub use storage::{
    EvalStore, MessageStore, ResourceStore, SqliteStore, Storage, ThreadStore, TraceStore,
    WorkflowStore,
};
