//! Durable per-(source, field) read positions
//!
//! `advance` is the only mutator and the orchestrator calls it only after a
//! batch is durably committed. A crash between commit and advance is safe:
//! the batch is re-pulled, the idempotency guard recognizes it, and the
//! checkpoint catches up.

mod memory;
mod postgres;

pub use memory::MemoryCheckpointStore;
pub use postgres::PgCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use syncpipe_common::{FieldType, Value};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub field: String,
    pub last_value: Value,
    pub value_type: FieldType,
    /// Cumulative rows pulled under this checkpoint
    pub rows_pulled: u64,
    pub last_pulled_at: DateTime<Utc>,
}

/// Arguments to [`CheckpointStore::advance`]
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointUpdate {
    pub source_id: String,
    pub field: String,
    pub value: Value,
    pub value_type: FieldType,
    /// Rows pulled by this batch; added to the running total
    pub rows_pulled: u64,
    /// Reject values strictly below the current one
    pub monotonic: bool,
    pub pulled_at: DateTime<Utc>,
}

impl CheckpointUpdate {
    /// Error if this update would move a monotonic checkpoint backwards
    ///
    /// Equal values are accepted. Values that cannot be compared with the
    /// current one (a type change) are treated as a regression.
    pub fn check_against(&self, current: &Checkpoint) -> SyncResult<()> {
        if !self.monotonic {
            return Ok(());
        }
        match self.value.compare(&current.last_value) {
            Some(Ordering::Less) | None => Err(SyncError::CheckpointRegression {
                source_id: self.source_id.clone(),
                field: self.field.clone(),
                current: current.last_value.to_text(),
                proposed: self.value.to_text(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Checkpoint state after applying this update to `current`
    pub fn apply(&self, current: Option<&Checkpoint>) -> Checkpoint {
        Checkpoint {
            source_id: self.source_id.clone(),
            field: self.field.clone(),
            last_value: self.value.clone(),
            value_type: self.value_type,
            rows_pulled: current.map(|c| c.rows_pulled).unwrap_or(0) + self.rows_pulled,
            last_pulled_at: self.pulled_at,
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, source_id: &str, field: &str) -> SyncResult<Option<Checkpoint>>;

    async fn advance(&self, update: CheckpointUpdate) -> SyncResult<Checkpoint>;

    /// All checkpoints of a source, ordered by field
    async fn list(&self, source_id: &str) -> SyncResult<Vec<Checkpoint>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn update(value: i64, monotonic: bool) -> CheckpointUpdate {
        CheckpointUpdate {
            source_id: "s".into(),
            field: "seq".into(),
            value: Value::Int(value),
            value_type: FieldType::Int,
            rows_pulled: 10,
            monotonic,
            pulled_at: Utc::now(),
        }
    }

    #[test]
    fn test_check_against() {
        let current = update(5, true).apply(None);
        assert!(update(6, true).check_against(&current).is_ok());
        assert!(update(5, true).check_against(&current).is_ok());
        assert!(matches!(
            update(4, true).check_against(&current),
            Err(SyncError::CheckpointRegression { .. })
        ));
        assert!(update(4, false).check_against(&current).is_ok());
    }

    #[test]
    fn test_type_change_is_regression_when_monotonic() {
        let current = update(5, true).apply(None);
        let mut changed = update(6, true);
        changed.value = Value::from("6");
        assert!(changed.check_against(&current).is_err());
    }

    #[test]
    fn test_apply_accumulates_rows() {
        let first = update(1, true).apply(None);
        let second = update(2, true).apply(Some(&first));
        assert_eq!(second.rows_pulled, 20);
        assert_eq!(second.last_value, Value::Int(2));
    }
}
