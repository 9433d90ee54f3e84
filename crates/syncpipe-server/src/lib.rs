//! Syncpipe Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental data synchronization: scheduled jobs pull batches from
//! external sources, transform and cleanse them, and commit each batch
//! exactly once before advancing a durable checkpoint.
//!
//! # Overview
//!
//! - **Sync engine** ([`sync`]): connectors, checkpoints, transformation,
//!   cleansing, idempotency, semantic cache, orchestrator and run history
//! - **Persistence**: PostgreSQL through SQLx, with in-memory equivalents
//!   for tests and `--in-memory` runs
//! - **Ops API** ([`api`]): job status, history, triggers, checkpoints and export
//! - **Configuration** ([`config`]): environment-based process settings
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use syncpipe_server::sync::{JobsFile, Orchestrator};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let file = JobsFile::load(std::path::Path::new("config/jobs.toml"))?;
//! let orchestrator = Arc::new(Orchestrator::builder(file.registry()?).build());
//! for job in file.to_jobs(orchestrator.settings()) {
//!     orchestrator.register(job).await?;
//! }
//! orchestrator.tick(chrono::Utc::now()).await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod sync;

// Re-export commonly used types
pub use error::{ErrorKind, SyncError, SyncResult};
