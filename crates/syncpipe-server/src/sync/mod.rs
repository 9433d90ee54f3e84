//! Incremental synchronization engine
//!
//! A job pulls bounded batches from a [`connector::Connector`] starting after
//! its stored checkpoint, runs them through the [`transform`] pipeline and the
//! [`cleanse`] engine, commits the surviving records exactly once through the
//! [`idempotency`] guard and a [`sink::BatchSink`], and only then advances
//! the [`checkpoint`]. The [`orchestrator`] schedules jobs and records every
//! run in the [`history`] log.

pub mod cache;
pub mod checkpoint;
pub mod cleanse;
pub mod config;
pub mod connector;
pub mod events;
pub mod export;
pub mod history;
pub mod idempotency;
pub mod models;
pub mod orchestrator;
pub mod sink;
pub mod transform;

pub use config::{JobDefinition, JobsFile};
pub use models::{ExecutionStatus, JobStatus, PullConfig, RunSummary, SyncExecution, SyncJob};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RetryPolicy, RunOutcome, SkipReason};
