//! The commit target controlled by this pipeline
//!
//! Batches are stored whole, unique on `(batch_id, sequence)`. A repeated
//! commit of the same batch is a no-op reported through
//! [`CommitReceipt::inserted`]. The Postgres sink marks the batch's
//! idempotency reservation committed in the same transaction as the rows.

mod memory;
mod postgres;

pub use memory::MemorySink;
pub use postgres::PgSink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use syncpipe_common::DataBatch;

use crate::error::SyncResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub rows_written: u64,
    /// False when the batch was already present
    pub inserted: bool,
    pub committed_at: DateTime<Utc>,
}

#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn commit(&self, batch: &DataBatch, idempotency_key: &str) -> SyncResult<CommitReceipt>;

    /// Committed batches of a source in commit order
    async fn batches(&self, source_id: &str) -> SyncResult<Vec<DataBatch>>;
}
