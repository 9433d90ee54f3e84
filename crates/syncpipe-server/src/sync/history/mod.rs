//! Job definitions and run history
//!
//! Jobs keep only counters; the detail of every run lives in the
//! append-only execution log.

mod memory;
mod postgres;

pub use memory::{MemoryExecutionLog, MemoryJobStore};
pub use postgres::{PgExecutionLog, PgJobStore};

use async_trait::async_trait;
use uuid::Uuid;

use super::models::{SyncExecution, SyncJob};
use crate::error::SyncResult;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job by id
    async fn save(&self, job: &SyncJob) -> SyncResult<()>;

    async fn get(&self, id: Uuid) -> SyncResult<Option<SyncJob>>;

    /// All jobs ordered by name
    async fn list(&self) -> SyncResult<Vec<SyncJob>>;
}

#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn append(&self, execution: &SyncExecution) -> SyncResult<()>;

    /// Most recent runs of a job first
    async fn list(&self, job_id: Uuid, limit: usize) -> SyncResult<Vec<SyncExecution>>;
}
