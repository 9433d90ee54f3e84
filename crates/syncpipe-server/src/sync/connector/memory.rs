//! In-memory connector for tests and demos

use async_trait::async_trait;
use std::sync::Arc;
use syncpipe_common::DataRecord;
use tokio::sync::RwLock;

use super::{select_after, Connector, PullOutcome, PullRequest};
use crate::error::SyncResult;

/// Serves a fixed, growable record set
///
/// Clones share the same rows, so a test can keep a handle and append
/// records between runs.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    source_id: String,
    records: Arc<RwLock<Vec<DataRecord>>>,
}

impl MemoryConnector {
    pub fn new(source_id: impl Into<String>, records: Vec<DataRecord>) -> Self {
        Self {
            source_id: source_id.into(),
            records: Arc::new(RwLock::new(records)),
        }
    }

    pub async fn append(&self, records: impl IntoIterator<Item = DataRecord>) {
        self.records.write().await.extend(records);
    }

    pub async fn row_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullOutcome> {
        let snapshot = self.records.read().await.clone();
        let records = select_after(snapshot, &request.position, request.limit);
        tracing::debug!(
            source_id = %self.source_id,
            sequence = request.sequence,
            records = records.len(),
            "Pulled from memory source"
        );
        Ok(request.outcome(&self.source_id, records))
    }
}
