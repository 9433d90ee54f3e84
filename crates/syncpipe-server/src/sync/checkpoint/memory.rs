use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::{Checkpoint, CheckpointStore, CheckpointUpdate};
use crate::error::SyncResult;

/// Process-local checkpoint store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<(String, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, source_id: &str, field: &str) -> SyncResult<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.lock().await;
        Ok(checkpoints.get(&(source_id.to_string(), field.to_string())).cloned())
    }

    async fn advance(&self, update: CheckpointUpdate) -> SyncResult<Checkpoint> {
        let mut checkpoints = self.checkpoints.lock().await;
        let key = (update.source_id.clone(), update.field.clone());
        let current = checkpoints.get(&key);
        if let Some(current) = current {
            update.check_against(current)?;
        }
        let next = update.apply(current);
        checkpoints.insert(key, next.clone());
        Ok(next)
    }

    async fn list(&self, source_id: &str) -> SyncResult<Vec<Checkpoint>> {
        let checkpoints = self.checkpoints.lock().await;
        Ok(checkpoints
            .iter()
            .filter(|((source, _), _)| source == source_id)
            .map(|(_, checkpoint)| checkpoint.clone())
            .collect())
    }
}
