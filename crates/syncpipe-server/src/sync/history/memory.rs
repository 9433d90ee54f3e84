use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ExecutionLog, JobStore};
use crate::error::SyncResult;
use crate::sync::models::{SyncExecution, SyncJob};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, SyncJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &SyncJob) -> SyncResult<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> SyncResult<Option<SyncJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list(&self) -> SyncResult<Vec<SyncJob>> {
        let mut jobs: Vec<SyncJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }
}

#[derive(Debug, Default)]
pub struct MemoryExecutionLog {
    executions: RwLock<Vec<SyncExecution>>,
}

impl MemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionLog for MemoryExecutionLog {
    async fn append(&self, execution: &SyncExecution) -> SyncResult<()> {
        self.executions.write().await.push(execution.clone());
        Ok(())
    }

    async fn list(&self, job_id: Uuid, limit: usize) -> SyncResult<Vec<SyncExecution>> {
        Ok(self
            .executions
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| e.job_id == job_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
