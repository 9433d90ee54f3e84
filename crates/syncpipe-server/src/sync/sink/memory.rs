use async_trait::async_trait;
use chrono::Utc;
use syncpipe_common::DataBatch;
use tokio::sync::RwLock;

use super::{BatchSink, CommitReceipt};
use crate::error::SyncResult;

#[derive(Debug, Clone)]
struct Committed {
    key: String,
    batch: DataBatch,
}

/// In-memory sink used by tests and `--in-memory` runs
#[derive(Debug, Default)]
pub struct MemorySink {
    committed: RwLock<Vec<Committed>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows committed for a source across all batches
    pub async fn row_count(&self, source_id: &str) -> usize {
        self.committed
            .read()
            .await
            .iter()
            .filter(|c| c.batch.source_id == source_id)
            .map(|c| c.batch.len())
            .sum()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.committed.read().await.iter().map(|c| c.key.clone()).collect()
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn commit(&self, batch: &DataBatch, idempotency_key: &str) -> SyncResult<CommitReceipt> {
        let mut committed = self.committed.write().await;
        let exists = committed
            .iter()
            .any(|c| c.batch.batch_id == batch.batch_id && c.batch.sequence == batch.sequence);

        if !exists {
            committed.push(Committed {
                key: idempotency_key.to_string(),
                batch: batch.clone(),
            });
        }

        Ok(CommitReceipt {
            rows_written: if exists { 0 } else { batch.len() as u64 },
            inserted: !exists,
            committed_at: Utc::now(),
        })
    }

    async fn batches(&self, source_id: &str) -> SyncResult<Vec<DataBatch>> {
        Ok(self
            .committed
            .read()
            .await
            .iter()
            .filter(|c| c.batch.source_id == source_id)
            .map(|c| c.batch.clone())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use syncpipe_common::DataRecord;

    #[tokio::test]
    async fn test_commit_is_unique_per_batch() {
        let sink = MemorySink::new();
        let batch = DataBatch::new("crm", 0, Utc::now(), vec![DataRecord::new("1"), DataRecord::new("2")]);

        let first = sink.commit(&batch, "k").await.unwrap();
        let second = sink.commit(&batch, "k").await.unwrap();
        assert!(first.inserted);
        assert_eq!(first.rows_written, 2);
        assert!(!second.inserted);
        assert_eq!(sink.row_count("crm").await, 2);
        assert_eq!(sink.batches("crm").await.unwrap().len(), 1);
        assert!(sink.batches("erp").await.unwrap().is_empty());
    }
}
