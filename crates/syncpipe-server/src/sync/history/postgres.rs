//! `sync_jobs`, `sync_executions` and `data_sources` tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::time::Duration;
use syncpipe_common::Value;
use uuid::Uuid;

use super::{ExecutionLog, JobStore};
use crate::error::{SyncError, SyncResult};
use crate::sync::cleanse::CleansingRules;
use crate::sync::connector::SourceConfig;
use crate::sync::models::{PullConfig, SyncExecution, SyncJob};
use crate::sync::orchestrator::RetryPolicy;
use crate::sync::transform::TransformRules;

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    source_id: String,
    cron_expression: String,
    priority: i32,
    enabled: bool,
    pull: Json<PullConfig>,
    retry_policy: Json<RetryPolicy>,
    timeout_secs: i64,
    transform_rules: Json<TransformRules>,
    cleansing_rules: Json<CleansingRules>,
    status: String,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    total_runs: i64,
    successful_runs: i64,
    failed_runs: i64,
    rows_synced: i64,
    last_error: Option<String>,
    retries_used: i32,
}

impl TryFrom<JobRow> for SyncJob {
    type Error = SyncError;

    fn try_from(row: JobRow) -> SyncResult<Self> {
        Ok(SyncJob {
            id: row.id,
            name: row.name,
            source_id: row.source_id,
            cron_expression: row.cron_expression,
            priority: row.priority,
            enabled: row.enabled,
            pull: row.pull.0,
            retry_policy: row.retry_policy.0,
            timeout: Duration::from_secs(to_u64(row.timeout_secs)),
            transform_rules: row.transform_rules.0,
            cleansing_rules: row.cleansing_rules.0,
            status: row.status.parse().map_err(SyncError::Validation)?,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            total_runs: to_u64(row.total_runs),
            successful_runs: to_u64(row.successful_runs),
            failed_runs: to_u64(row.failed_runs),
            rows_synced: to_u64(row.rows_synced),
            last_error: row.last_error,
            retries_used: u32::try_from(row.retries_used).unwrap_or(0),
        })
    }
}

const JOB_COLUMNS: &str = "id, name, source_id, cron_expression, priority, enabled, pull, retry_policy, \
     timeout_secs, transform_rules, cleansing_rules, status, next_run_at, last_run_at, total_runs, \
     successful_runs, failed_runs, rows_synced, last_error, retries_used";

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Mirror the configured sources into `data_sources`
    pub async fn record_sources(&self, sources: &[SourceConfig]) -> SyncResult<()> {
        for source in sources {
            sqlx::query(
                r#"
                INSERT INTO data_sources (id, kind, config, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (id) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    config = EXCLUDED.config,
                    updated_at = NOW()
                "#,
            )
            .bind(&source.id)
            .bind(source.kind.as_str())
            .bind(Json(source))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn save(&self, job: &SyncJob) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, name, source_id, cron_expression, priority, enabled, pull, retry_policy,
                timeout_secs, transform_rules, cleansing_rules, status, next_run_at, last_run_at,
                total_runs, successful_runs, failed_runs, rows_synced, last_error, retries_used, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, NOW())
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                source_id = EXCLUDED.source_id,
                cron_expression = EXCLUDED.cron_expression,
                priority = EXCLUDED.priority,
                enabled = EXCLUDED.enabled,
                pull = EXCLUDED.pull,
                retry_policy = EXCLUDED.retry_policy,
                timeout_secs = EXCLUDED.timeout_secs,
                transform_rules = EXCLUDED.transform_rules,
                cleansing_rules = EXCLUDED.cleansing_rules,
                status = EXCLUDED.status,
                next_run_at = EXCLUDED.next_run_at,
                last_run_at = EXCLUDED.last_run_at,
                total_runs = EXCLUDED.total_runs,
                successful_runs = EXCLUDED.successful_runs,
                failed_runs = EXCLUDED.failed_runs,
                rows_synced = EXCLUDED.rows_synced,
                last_error = EXCLUDED.last_error,
                retries_used = EXCLUDED.retries_used,
                updated_at = NOW()
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.source_id)
        .bind(&job.cron_expression)
        .bind(job.priority)
        .bind(job.enabled)
        .bind(Json(&job.pull))
        .bind(Json(&job.retry_policy))
        .bind(to_i64(job.timeout.as_secs()))
        .bind(Json(&job.transform_rules))
        .bind(Json(&job.cleansing_rules))
        .bind(job.status.as_str())
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(to_i64(job.total_runs))
        .bind(to_i64(job.successful_runs))
        .bind(to_i64(job.failed_runs))
        .bind(to_i64(job.rows_synced))
        .bind(&job.last_error)
        .bind(i32::try_from(job.retries_used).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> SyncResult<Option<SyncJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {} FROM sync_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SyncJob::try_from).transpose()
    }

    async fn list(&self) -> SyncResult<Vec<SyncJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!("SELECT {} FROM sync_jobs ORDER BY name", JOB_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SyncJob::try_from).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    job_id: Uuid,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    status: String,
    rows_synced: i64,
    rows_rejected: i64,
    rows_flagged: i64,
    bytes_processed: i64,
    duration_ms: i64,
    error_message: Option<String>,
    error_details: Option<Json<serde_json::Value>>,
    error_counts: Json<BTreeMap<String, u64>>,
    retry_count: i32,
    checkpoint_value: Option<Json<Value>>,
}

impl TryFrom<ExecutionRow> for SyncExecution {
    type Error = SyncError;

    fn try_from(row: ExecutionRow) -> SyncResult<Self> {
        Ok(SyncExecution {
            id: row.id,
            job_id: row.job_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            status: row.status.parse().map_err(SyncError::Validation)?,
            rows_synced: to_u64(row.rows_synced),
            rows_rejected: to_u64(row.rows_rejected),
            rows_flagged: to_u64(row.rows_flagged),
            bytes_processed: to_u64(row.bytes_processed),
            duration_ms: to_u64(row.duration_ms),
            error_message: row.error_message,
            error_details: row.error_details.map(|j| j.0),
            error_counts: row.error_counts.0,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            checkpoint_value: row.checkpoint_value.map(|j| j.0),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgExecutionLog {
    pool: PgPool,
}

impl PgExecutionLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionLog for PgExecutionLog {
    async fn append(&self, execution: &SyncExecution) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_executions (
                id, job_id, started_at, completed_at, status, rows_synced, rows_rejected, rows_flagged,
                bytes_processed, duration_ms, error_message, error_details, error_counts, retry_count,
                checkpoint_value
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(execution.id)
        .bind(execution.job_id)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.status.as_str())
        .bind(to_i64(execution.rows_synced))
        .bind(to_i64(execution.rows_rejected))
        .bind(to_i64(execution.rows_flagged))
        .bind(to_i64(execution.bytes_processed))
        .bind(to_i64(execution.duration_ms))
        .bind(&execution.error_message)
        .bind(execution.error_details.as_ref().map(Json))
        .bind(Json(&execution.error_counts))
        .bind(i32::try_from(execution.retry_count).unwrap_or(i32::MAX))
        .bind(execution.checkpoint_value.as_ref().map(Json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, job_id: Uuid, limit: usize) -> SyncResult<Vec<SyncExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, job_id, started_at, completed_at, status, rows_synced, rows_rejected, rows_flagged,
                   bytes_processed, duration_ms, error_message, error_details, error_counts, retry_count,
                   checkpoint_value
            FROM sync_executions
            WHERE job_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncExecution::try_from).collect()
    }
}
