//! Shared helpers for syncpipe integration tests
//!
//! - [`TestPostgres`]: a throwaway PostgreSQL container with migrations applied
//!   (needs Docker; tests using it are `#[ignore]`)
//! - [`ScriptedConnector`]: a memory connector that fails or stalls on demand
//! - [`FailingSink`] / [`FailingCheckpoints`]: stores that fail their first N writes
//! - [`SlowSink`]: a sink whose first commit takes longer than a job timeout
//! - [`Harness`]: an orchestrator on in-memory stores and a manual clock

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncpipe_common::clock::ManualClock;
use syncpipe_common::{DataBatch, DataRecord};
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Mutex;
use tracing::info;

use syncpipe_server::sync::cache::MemoryCache;
use syncpipe_server::sync::checkpoint::{Checkpoint, CheckpointStore, CheckpointUpdate, MemoryCheckpointStore};
use syncpipe_server::sync::connector::{Connector, ConnectorRegistry, MemoryConnector, PullOutcome, PullRequest};
use syncpipe_server::sync::sink::{BatchSink, CommitReceipt, MemorySink};
use syncpipe_server::sync::Orchestrator;
use syncpipe_server::{SyncError, SyncResult};

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    /// Start PostgreSQL 16 and run the workspace migrations
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .context("Failed to get container port")?;
        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }
}

// ============================================================================
// Records and time
// ============================================================================

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

/// Record with an integer `seq` checkpoint field
pub fn seq_record(id: &str, seq: i64) -> DataRecord {
    DataRecord::new(id).with_field("id", id).with_field("seq", seq)
}

/// Record whose `updated_at` arrives as an RFC 3339 string, the way JSON sources deliver it
pub fn timestamped(id: &str, updated_at: &str) -> DataRecord {
    DataRecord::new(id).with_field("id", id).with_field("updated_at", updated_at)
}

// ============================================================================
// Scripted connector
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum Script {
    ConnectionError,
    AuthenticationError,
    /// Sleep before serving the pull
    Stall(Duration),
}

/// Memory connector that consumes one script step per pull before serving data
///
/// `every_pull` steps apply to every pull after the queue is drained.
#[derive(Clone)]
pub struct ScriptedConnector {
    inner: MemoryConnector,
    steps: Arc<Mutex<VecDeque<Script>>>,
    every_pull: Option<Script>,
    pulls: Arc<AtomicU32>,
}

impl ScriptedConnector {
    pub fn new(source_id: &str, records: Vec<DataRecord>) -> Self {
        Self {
            inner: MemoryConnector::new(source_id, records),
            steps: Arc::new(Mutex::new(VecDeque::new())),
            every_pull: None,
            pulls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn then(self, step: Script) -> Self {
        if let Ok(mut steps) = self.steps.try_lock() {
            steps.push_back(step);
        }
        self
    }

    pub fn on_every_pull(mut self, step: Script) -> Self {
        self.every_pull = Some(step);
        self
    }

    pub fn data(&self) -> &MemoryConnector {
        &self.inner
    }

    pub fn pulls(&self) -> u32 {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullOutcome> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().await.pop_front().or(self.every_pull);
        match step {
            Some(Script::ConnectionError) => return Err(SyncError::connection("connection refused")),
            Some(Script::AuthenticationError) => return Err(SyncError::authentication("token rejected")),
            Some(Script::Stall(delay)) => tokio::time::sleep(delay).await,
            None => {},
        }
        self.inner.pull(request).await
    }
}

// ============================================================================
// Failing stores
// ============================================================================

/// Sink whose first `failures` commits error out
pub struct FailingSink {
    inner: MemorySink,
    remaining: AtomicU32,
}

impl FailingSink {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemorySink::new(),
            remaining: AtomicU32::new(failures),
        }
    }

    pub fn inner(&self) -> &MemorySink {
        &self.inner
    }
}

#[async_trait]
impl BatchSink for FailingSink {
    async fn commit(&self, batch: &DataBatch, idempotency_key: &str) -> SyncResult<CommitReceipt> {
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::Sink("warehouse unavailable".into()));
        }
        self.inner.commit(batch, idempotency_key).await
    }

    async fn batches(&self, source_id: &str) -> SyncResult<Vec<DataBatch>> {
        self.inner.batches(source_id).await
    }
}

/// Sink that sleeps before writing its first commit
pub struct SlowSink {
    inner: Arc<MemorySink>,
    delay: Duration,
    slowed: AtomicU32,
}

impl SlowSink {
    pub fn new(inner: Arc<MemorySink>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            slowed: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl BatchSink for SlowSink {
    async fn commit(&self, batch: &DataBatch, idempotency_key: &str) -> SyncResult<CommitReceipt> {
        if self.slowed.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.commit(batch, idempotency_key).await
    }

    async fn batches(&self, source_id: &str) -> SyncResult<Vec<DataBatch>> {
        self.inner.batches(source_id).await
    }
}

/// Checkpoint store whose first `failures` advances error out, as if the
/// process died between commit and checkpoint
pub struct FailingCheckpoints {
    inner: MemoryCheckpointStore,
    remaining: AtomicU32,
}

impl FailingCheckpoints {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl CheckpointStore for FailingCheckpoints {
    async fn get(&self, source_id: &str, field: &str) -> SyncResult<Option<Checkpoint>> {
        self.inner.get(source_id, field).await
    }

    async fn advance(&self, update: CheckpointUpdate) -> SyncResult<Checkpoint> {
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::connection("checkpoint store unreachable"));
        }
        self.inner.advance(update).await
    }

    async fn list(&self, source_id: &str) -> SyncResult<Vec<Checkpoint>> {
        self.inner.list(source_id).await
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Orchestrator over in-memory stores with a manual clock
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub clock: ManualClock,
    pub sink: Arc<MemorySink>,
    pub cache: Arc<MemoryCache>,
}

impl Harness {
    pub fn new(connector: impl Connector + 'static) -> Self {
        let sink = Arc::new(MemorySink::new());
        Self::with_sink(connector, sink.clone(), sink)
    }

    pub fn with_sink(connector: impl Connector + 'static, sink: Arc<dyn BatchSink>, memory: Arc<MemorySink>) -> Self {
        let clock = ManualClock::new(start_time());
        let cache = Arc::new(MemoryCache::with_clock(64, Arc::new(clock.clone())));
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(connector));

        let orchestrator = Orchestrator::builder(registry)
            .clock(Arc::new(clock.clone()))
            .cache(cache.clone())
            .sink(sink)
            .build();

        Self {
            orchestrator: Arc::new(orchestrator),
            clock,
            sink: memory,
            cache,
        }
    }

    pub fn with_checkpoints(connector: impl Connector + 'static, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        let clock = ManualClock::new(start_time());
        let sink = Arc::new(MemorySink::new());
        let cache = Arc::new(MemoryCache::with_clock(64, Arc::new(clock.clone())));
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(connector));

        let orchestrator = Orchestrator::builder(registry)
            .clock(Arc::new(clock.clone()))
            .cache(cache.clone())
            .sink(sink.clone())
            .checkpoints(checkpoints)
            .build();

        Self {
            orchestrator: Arc::new(orchestrator),
            clock,
            sink,
            cache,
        }
    }
}
