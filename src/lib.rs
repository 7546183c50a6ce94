//! # Stateful Collector Library
//!
//! Incremental, rate-aware collection of paginated HTTP APIs into an
//! idempotent raw store, sequenced as a pipeline of dependent stages.
//!
//! ## Features
//!
//! - **Incremental Sync**: watermarks are recomputed from previously extracted rows
//! - **Bounded Concurrency**: input items are fetched in parallel, pages of one item in order
//! - **Item Isolation**: a 404 or an exhausted retry budget skips one item, not the stage
//! - **Idempotent Raw Store**: pages are keyed by `(params, input, page)` and replaced on re-collection
//! - **Dependency-Ordered Stages**: stages declare the tables they read and write
//! - **Cooperative Cancellation**: stops at page boundaries, keeping what was persisted
//!
//! ## Quick Start
//!
//! ```no_run
//! use stateful_collector::collector::HttpApiClient;
//! use stateful_collector::plugins::{default_registry, github::GithubParams};
//! use stateful_collector::store::FileStore;
//! use stateful_collector::subtask::{PipelineRunner, TaskContext};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FileStore::open("./data")?);
//! let client = HttpApiClient::new("https://api.github.com")?
//!     .with_token(std::env::var("GITHUB_TOKEN").ok());
//! let params = GithubParams { connection_id: 1, name: "apache/devlake".into() };
//!
//! let ctx = TaskContext::new(store.clone(), store, Arc::new(client), params.to_value());
//! let registry = default_registry()?;
//! let report = PipelineRunner::new(&registry).run(&ctx).await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`store`] - Raw page store and entity tables (file and in-memory)
//! - [`cursor`] - Lazy, restartable input sequences over entity tables
//! - [`sync_state`] - Full vs. incremental decision and watermark
//! - [`collector`] - The stateful API collector and its strategy seam
//! - [`subtask`] - Stage metadata, registry, and pipeline runner
//! - [`plugins`] - Data source integrations (GitHub Actions)

#![warn(missing_docs)]
#![warn(clippy::all)]

/// CLI command implementations
pub mod cli;

/// Stateful API collector
pub mod collector;

/// Cursor iteration over entity tables
pub mod cursor;

/// Metrics registration and recorders
pub mod metrics;

/// Data source integrations
pub mod plugins;

/// Cooperative cancellation
pub mod shutdown;

/// Raw and entity persistence
pub mod store;

/// Pipeline stages
pub mod subtask;

/// Sync mode resolution
pub mod sync_state;

// Re-export commonly used types
pub use collector::{CollectionSummary, CollectorSettings, StatefulApiCollector};
pub use cursor::CursorIterator;
pub use shutdown::{Cancellation, SharedCancellation};
pub use store::{EntityStore, FileStore, MemoryStore, RawDataStore};
pub use subtask::{PipelineRunner, SubTaskRegistry, TaskContext};
pub use sync_state::SyncStateResolver;
