//! Job scheduling, execution and bookkeeping
//!
//! The [`Orchestrator`] owns every registered job and the shared components a
//! run needs. Jobs move `pending → running → {succeeded, failed}`; a failed
//! job returns to the schedule after a backoff delay until its retries run
//! out. Disabling is a separate flag, checked before a run and between
//! batches.

mod retry;
mod runner;
mod schedule;
mod state;

pub use retry::RetryPolicy;
pub use schedule::CronSchedule;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use syncpipe_common::clock::{Clock, SystemClock};
use syncpipe_common::DataBatch;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use self::runner::BatchRunner;
use self::state::{apply_cancelled, apply_failure, apply_success, JobHandle};
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::sync::cache::{MemoryCache, SemanticCache};
use crate::sync::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
use crate::sync::cleanse::CleansingEngine;
use crate::sync::connector::ConnectorRegistry;
use crate::sync::events::{EventBus, SyncEvent};
use crate::sync::history::{ExecutionLog, JobStore, MemoryExecutionLog, MemoryJobStore};
use crate::sync::idempotency::{IdempotencyGuard, MemoryIdempotencyGuard};
use crate::sync::models::{ExecutionStatus, JobStatus, RunSummary, SyncExecution, SyncJob};
use crate::sync::sink::{BatchSink, MemorySink};
use crate::sync::transform::TransformPipeline;

/// Why a due or requested run did not start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The previous run of this job is still in flight
    AlreadyRunning,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Executed(SyncExecution),
    Skipped { job_id: Uuid, reason: SkipReason },
}

impl RunOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            RunOutcome::Executed(execution) => execution.job_id,
            RunOutcome::Skipped { job_id, .. } => *job_id,
        }
    }

    pub fn execution(&self) -> Option<&SyncExecution> {
        match self {
            RunOutcome::Executed(execution) => Some(execution),
            RunOutcome::Skipped { .. } => None,
        }
    }
}

/// Builder for [`Orchestrator`]; every store defaults to its in-memory version
pub struct OrchestratorBuilder {
    registry: ConnectorRegistry,
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    guard: Option<Arc<dyn IdempotencyGuard>>,
    cache: Option<Arc<dyn SemanticCache>>,
    sink: Option<Arc<dyn BatchSink>>,
    jobs: Option<Arc<dyn JobStore>>,
    executions: Option<Arc<dyn ExecutionLog>>,
}

impl OrchestratorBuilder {
    pub fn new(registry: ConnectorRegistry) -> Self {
        Self {
            registry,
            settings: SyncSettings::default(),
            clock: Arc::new(SystemClock),
            checkpoints: None,
            guard: None,
            cache: None,
            sink: None,
            jobs: None,
            executions: None,
        }
    }

    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn idempotency_guard(mut self, guard: Arc<dyn IdempotencyGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn SemanticCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn BatchSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(store);
        self
    }

    pub fn execution_log(mut self, log: Arc<dyn ExecutionLog>) -> Self {
        self.executions = Some(log);
        self
    }

    pub fn build(self) -> Orchestrator {
        let settings = self.settings;
        let clock = self.clock;
        let idempotency_ttl = secs_to_chrono(settings.idempotency_ttl_secs);

        Orchestrator {
            registry: self.registry,
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
            guard: self
                .guard
                .unwrap_or_else(|| Arc::new(MemoryIdempotencyGuard::with_clock(idempotency_ttl, clock.clone()))),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(MemoryCache::with_clock(settings.cache_capacity, clock.clone()))),
            sink: self.sink.unwrap_or_else(|| Arc::new(MemorySink::new())),
            job_store: self.jobs.unwrap_or_else(|| Arc::new(MemoryJobStore::new())),
            execution_log: self.executions.unwrap_or_else(|| Arc::new(MemoryExecutionLog::new())),
            pipeline: TransformPipeline::new(),
            cleanser: CleansingEngine::default(),
            events: EventBus::new(settings.event_capacity),
            clock,
            settings,
            handles: RwLock::new(BTreeMap::new()),
        }
    }
}

fn secs_to_chrono(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Schedules and runs sync jobs
pub struct Orchestrator {
    registry: ConnectorRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    guard: Arc<dyn IdempotencyGuard>,
    cache: Arc<dyn SemanticCache>,
    sink: Arc<dyn BatchSink>,
    job_store: Arc<dyn JobStore>,
    execution_log: Arc<dyn ExecutionLog>,
    pipeline: TransformPipeline,
    cleanser: CleansingEngine,
    events: EventBus,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    handles: RwLock<BTreeMap<Uuid, Arc<JobHandle>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(registry: ConnectorRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder::new(registry)
    }

    /// Validate and add a job, carrying over runtime state persisted by a previous process
    #[tracing::instrument(skip(self, job), fields(job = %job.name))]
    pub async fn register(&self, mut job: SyncJob) -> SyncResult<SyncJob> {
        let schedule = CronSchedule::parse(&job.cron_expression)?;
        if !self.registry.contains(&job.source_id) {
            return Err(SyncError::config(format!(
                "Job '{}' references unknown source '{}'",
                job.name, job.source_id
            )));
        }
        if job.pull.checkpoint_field.is_empty() {
            return Err(SyncError::config(format!("Job '{}' has no checkpoint field", job.name)));
        }
        job.transform_rules.validate()?;
        job.cleansing_rules.validate()?;

        if let Some(stored) = self.job_store.get(job.id).await? {
            job.adopt_state(&stored);
        }
        if job.enabled && job.next_run_at.is_none() && !job.is_terminal() {
            job.next_run_at = schedule.next_after(self.clock.now());
        }

        self.job_store.save(&job).await?;
        info!(job_id = %job.id, next_run_at = ?job.next_run_at, "Job registered");

        let handle = Arc::new(JobHandle::new(job.clone(), schedule));
        self.handles.write().await.insert(job.id, handle);
        Ok(job)
    }

    /// Start every job due at `now`, highest priority first (ties by job id),
    /// and wait for them to finish
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<RunOutcome> {
        let mut due = Vec::new();
        for handle in self.handles.read().await.values() {
            let job = handle.job.read().await;
            if !handle.is_disabled() && job.is_due(now) {
                due.push((job.priority, job.id, handle.clone()));
            }
        }
        due.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        if !due.is_empty() {
            info!(count = due.len(), "Starting due jobs");
        }

        let (job_ids, tasks): (Vec<Uuid>, Vec<JoinHandle<RunOutcome>>) = due
            .into_iter()
            .map(|(_, job_id, handle)| {
                let this = Arc::clone(self);
                (job_id, tokio::spawn(async move { this.execute(handle).await }))
            })
            .unzip();

        let results = futures::future::join_all(tasks).await;
        job_ids
            .into_iter()
            .zip(results)
            .filter_map(|(job_id, result)| match result {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Job task panicked");
                    None
                },
            })
            .collect()
    }

    /// Tick on a fixed interval until `shutdown` resolves
    pub async fn run_loop<F>(self: Arc<Self>, interval: Duration, shutdown: F)
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "Scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let now = self.clock.now();
                    self.tick(now).await;
                    self.housekeeping().await;
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Spawn [`Orchestrator::run_loop`] with the configured tick interval
    pub fn start<F>(self: Arc<Self>, shutdown: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let interval = self.settings.tick_interval();
        tokio::spawn(self.run_loop(interval, shutdown))
    }

    /// Run a job immediately regardless of its schedule
    pub async fn run_now(self: &Arc<Self>, job_id: Uuid) -> SyncResult<RunOutcome> {
        let handle = self.handle(job_id).await?;
        Ok(self.execute(handle).await)
    }

    /// Clear the disabled flag and any exhausted retry state, and reschedule from the cron expression
    pub async fn enable(&self, job_id: Uuid) -> SyncResult<SyncJob> {
        let handle = self.handle(job_id).await?;
        let job = {
            let mut job = handle.job.write().await;
            job.enabled = true;
            job.retries_used = 0;
            if job.status == JobStatus::Failed {
                job.status = JobStatus::Pending;
            }
            job.next_run_at = handle.schedule.next_after(self.clock.now());
            handle.set_disabled(false);
            job.clone()
        };
        self.job_store.save(&job).await?;
        info!(job_id = %job_id, next_run_at = ?job.next_run_at, "Job enabled");
        Ok(job)
    }

    /// Stop scheduling a job; a run in flight stops before its next batch
    pub async fn disable(&self, job_id: Uuid) -> SyncResult<SyncJob> {
        let handle = self.handle(job_id).await?;
        handle.set_disabled(true);
        let job = {
            let mut job = handle.job.write().await;
            job.enabled = false;
            job.clone()
        };
        self.job_store.save(&job).await?;
        info!(job_id = %job_id, "Job disabled");
        Ok(job)
    }

    pub async fn job(&self, job_id: Uuid) -> SyncResult<SyncJob> {
        let handle = self.handle(job_id).await?;
        let job = handle.job.read().await.clone();
        Ok(job)
    }

    /// Registered jobs ordered by name
    pub async fn jobs(&self) -> Vec<SyncJob> {
        let mut jobs = Vec::new();
        for handle in self.handles.read().await.values() {
            jobs.push(handle.job.read().await.clone());
        }
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub async fn executions(&self, job_id: Uuid, limit: usize) -> SyncResult<Vec<SyncExecution>> {
        self.handle(job_id).await?;
        self.execution_log.list(job_id, limit).await
    }

    pub async fn checkpoints(&self, source_id: &str) -> SyncResult<Vec<Checkpoint>> {
        if !self.registry.contains(source_id) {
            return Err(SyncError::NotFound(format!("source {}", source_id)));
        }
        self.checkpoints.list(source_id).await
    }

    /// Batches committed for a source, in commit order
    pub async fn committed_batches(&self, source_id: &str) -> SyncResult<Vec<DataBatch>> {
        if !self.registry.contains(source_id) {
            return Err(SyncError::NotFound(format!("source {}", source_id)));
        }
        self.sink.batches(source_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Drop expired cache entries and idempotency records
    pub async fn housekeeping(&self) {
        match self.cache.sweep().await {
            Ok(0) => {},
            Ok(n) => info!(removed = n, "Swept expired cache entries"),
            Err(e) => warn!(error = %e, "Cache sweep failed"),
        }
        match self.guard.purge_expired().await {
            Ok(0) => {},
            Ok(n) => info!(removed = n, "Purged expired idempotency records"),
            Err(e) => warn!(error = %e, "Idempotency purge failed"),
        }
    }

    async fn handle(&self, job_id: Uuid) -> SyncResult<Arc<JobHandle>> {
        self.handles
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("job {}", job_id)))
    }

    #[tracing::instrument(skip(self, handle), fields(job_id))]
    async fn execute(&self, handle: Arc<JobHandle>) -> RunOutcome {
        let job_id = handle.job.read().await.id;
        tracing::Span::current().record("job_id", tracing::field::display(job_id));

        let Ok(_running) = handle.run_lock.try_lock() else {
            warn!("Previous run still in flight; skipping");
            return RunOutcome::Skipped {
                job_id,
                reason: SkipReason::AlreadyRunning,
            };
        };
        if handle.is_disabled() {
            return RunOutcome::Skipped {
                job_id,
                reason: SkipReason::Disabled,
            };
        }

        let started_at = self.clock.now();
        let job = {
            let mut job = handle.job.write().await;
            job.status = JobStatus::Running;
            job.last_run_at = Some(started_at);
            job.clone()
        };
        if let Err(e) = self.job_store.save(&job).await {
            warn!(error = %e, "Could not persist running status");
        }
        info!(job = %job.name, source = %job.source_id, "Run started");

        let mut summary = RunSummary::default();
        let result = self.run_batches(&job, &handle, &mut summary).await;
        let completed_at = self.clock.now();

        let (status, error) = match &result {
            Ok(()) => (ExecutionStatus::Succeeded, None),
            Err(SyncError::Cancelled(_)) => (ExecutionStatus::Cancelled, None),
            Err(e) => (ExecutionStatus::Failed, Some(e)),
        };

        let (updated, retry_count) = {
            let mut current = handle.job.write().await;
            let retry_count = current.retries_used;
            match &result {
                Ok(()) => apply_success(&mut current, &handle.schedule, &summary, completed_at),
                Err(SyncError::Cancelled(_)) => apply_cancelled(&mut current, &summary),
                Err(e) => {
                    let retrying = apply_failure(&mut current, e, &summary, completed_at);
                    error!(
                        job = %current.name,
                        error = %e,
                        retrying,
                        next_run_at = ?current.next_run_at,
                        "Run failed"
                    );
                },
            }
            (current.clone(), retry_count)
        };

        let error_details = error.map(|e| {
            let mut details = serde_json::json!({ "kind": e.kind().as_str() });
            if let (Some(extra), Some(map)) = (summary.failure_details.take(), details.as_object_mut()) {
                map.insert("failure".to_string(), extra);
            }
            details
        });

        let execution = SyncExecution {
            id: Uuid::new_v4(),
            job_id,
            started_at,
            completed_at,
            status,
            rows_synced: summary.rows_synced,
            rows_rejected: summary.rows_rejected,
            rows_flagged: summary.rows_flagged,
            bytes_processed: summary.bytes_processed,
            duration_ms: u64::try_from((completed_at - started_at).num_milliseconds()).unwrap_or(0),
            error_message: error.map(|e| e.to_string()),
            error_details,
            error_counts: summary.error_counts.clone(),
            retry_count,
            checkpoint_value: summary.checkpoint_value.clone(),
        };

        if let Err(e) = self.execution_log.append(&execution).await {
            error!(error = %e, "Could not record execution");
        }
        if let Err(e) = self.job_store.save(&updated).await {
            error!(error = %e, "Could not persist job state");
        }

        info!(
            job = %updated.name,
            status = status.as_str(),
            batches = summary.batches,
            deduplicated = summary.batches_deduplicated,
            rows_synced = summary.rows_synced,
            rows_rejected = summary.rows_rejected,
            duration_ms = execution.duration_ms,
            "Run finished"
        );
        self.events.publish(SyncEvent::RunCompleted {
            job_id,
            execution_id: execution.id,
            status,
            rows_synced: summary.rows_synced,
            completed_at,
        });

        RunOutcome::Executed(execution)
    }

    async fn run_batches(&self, job: &SyncJob, handle: &JobHandle, summary: &mut RunSummary) -> SyncResult<()> {
        let connector = self.registry.get(&job.source_id)?;
        let runner = BatchRunner {
            connector: connector.as_ref(),
            checkpoints: self.checkpoints.as_ref(),
            guard: self.guard.as_ref(),
            cache: self.cache.as_ref(),
            sink: self.sink.as_ref(),
            pipeline: &self.pipeline,
            cleanser: &self.cleanser,
            events: &self.events,
            clock: self.clock.as_ref(),
            cache_ttl: secs_to_chrono(self.settings.cache_ttl_secs),
        };

        let deadline = tokio::time::Instant::now() + job.timeout;
        runner.run(job, handle, summary, deadline).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sync::connector::MemoryConnector;
    use crate::sync::models::PullConfig;
    use chrono::TimeZone;
    use syncpipe_common::clock::ManualClock;
    use syncpipe_common::{DataRecord, FieldType};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn orchestrator(connector: MemoryConnector, clock: &ManualClock) -> Arc<Orchestrator> {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(connector));
        Arc::new(Orchestrator::builder(registry).clock(Arc::new(clock.clone())).build())
    }

    fn job(name: &str) -> SyncJob {
        SyncJob::new(name, "crm", "*/5 * * * *", PullConfig::new("seq", FieldType::Int).with_batch_size(2))
    }

    fn rec(id: &str, seq: i64) -> DataRecord {
        DataRecord::new(id).with_field("seq", seq)
    }

    #[tokio::test]
    async fn test_register_rejects_unknown_source() {
        let clock = ManualClock::new(start());
        let orch = orchestrator(MemoryConnector::new("crm", vec![]), &clock);
        let mut bad = job("orders");
        bad.source_id = "billing".into();
        assert!(matches!(orch.register(bad).await, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_register_schedules_next_cron_time() {
        let clock = ManualClock::new(start());
        let orch = orchestrator(MemoryConnector::new("crm", vec![]), &clock);
        let job = orch.register(job("orders")).await.unwrap();
        assert_eq!(job.next_run_at, Some(start() + chrono::Duration::minutes(5)));
    }

    #[tokio::test]
    async fn test_run_now_pulls_in_batches_until_drained() {
        let clock = ManualClock::new(start());
        let connector = MemoryConnector::new("crm", vec![rec("a", 1), rec("b", 2), rec("c", 3), rec("d", 4), rec("e", 5)]);
        let orch = orchestrator(connector, &clock);
        let job = orch.register(job("orders")).await.unwrap();

        let outcome = orch.run_now(job.id).await.unwrap();
        let execution = outcome.execution().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.rows_synced, 5);
        assert_eq!(execution.checkpoint_value, Some(syncpipe_common::Value::Int(5)));
        assert_eq!(orch.committed_batches("crm").await.unwrap().len(), 3);

        let again = orch.run_now(job.id).await.unwrap();
        assert_eq!(again.execution().unwrap().rows_synced, 0);
        assert_eq!(orch.job(job.id).await.unwrap().total_runs, 2);
    }

    #[tokio::test]
    async fn test_disabled_job_is_skipped() {
        let clock = ManualClock::new(start());
        let orch = orchestrator(MemoryConnector::new("crm", vec![rec("a", 1)]), &clock);
        let job = orch.register(job("orders")).await.unwrap();
        orch.disable(job.id).await.unwrap();

        let outcome = orch.run_now(job.id).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Skipped {
                job_id: job.id,
                reason: SkipReason::Disabled
            }
        );

        clock.advance(chrono::Duration::minutes(10));
        assert!(orch.tick(clock.now()).await.is_empty());

        let enabled = orch.enable(job.id).await.unwrap();
        assert!(enabled.enabled);
        assert!(enabled.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_tick_orders_by_priority_then_id() {
        let clock = ManualClock::new(start());
        let orch = orchestrator(MemoryConnector::new("crm", vec![]), &clock);
        let low = orch.register(job("low")).await.unwrap();
        let high = orch.register(job("high").with_priority(10)).await.unwrap();
        let mid_a = orch.register(job("mid-a").with_priority(5)).await.unwrap();
        let mid_b = orch.register(job("mid-b").with_priority(5)).await.unwrap();

        clock.advance(chrono::Duration::minutes(5));
        let order: Vec<Uuid> = orch.tick(clock.now()).await.iter().map(RunOutcome::job_id).collect();

        let (first_mid, second_mid) = if mid_a.id < mid_b.id { (mid_a.id, mid_b.id) } else { (mid_b.id, mid_a.id) };
        assert_eq!(order, vec![high.id, first_mid, second_mid, low.id]);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let clock = ManualClock::new(start());
        let orch = orchestrator(MemoryConnector::new("crm", vec![]), &clock);
        assert!(matches!(orch.run_now(Uuid::new_v4()).await, Err(SyncError::NotFound(_))));
        assert!(matches!(orch.checkpoints("nope").await, Err(SyncError::NotFound(_))));
    }
}
