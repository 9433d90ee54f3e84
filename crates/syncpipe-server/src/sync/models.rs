//! Job, execution and run-summary models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use syncpipe_common::{FieldType, Value};
use uuid::Uuid;

use super::cleanse::CleansingRules;
use super::orchestrator::RetryPolicy;
use super::transform::TransformRules;
use crate::error::ErrorKind;

/// `std::time::Duration` as whole seconds, for TOML and JSONB columns
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// How a job reads its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullConfig {
    /// Field whose maximum becomes the checkpoint after each batch
    pub checkpoint_field: String,
    #[serde(default = "default_checkpoint_type")]
    pub checkpoint_type: FieldType,
    /// Reject checkpoint advances that would move backwards
    #[serde(default = "default_true")]
    pub monotonic: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Stop after this many batches even if the source has more
    #[serde(default)]
    pub max_batches_per_run: Option<u32>,
}

fn default_checkpoint_type() -> FieldType {
    FieldType::Datetime
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    500
}

impl PullConfig {
    pub fn new(checkpoint_field: impl Into<String>, checkpoint_type: FieldType) -> Self {
        Self {
            checkpoint_field: checkpoint_field.into(),
            checkpoint_type,
            monotonic: true,
            batch_size: default_batch_size(),
            max_batches_per_run: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled synchronization job
///
/// Definition fields come from configuration; the remaining fields are
/// runtime state owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub name: String,
    pub source_id: String,
    pub cron_expression: String,
    /// Higher runs first when several jobs are due on the same tick
    pub priority: i32,
    pub enabled: bool,
    pub pull: PullConfig,
    pub retry_policy: RetryPolicy,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub transform_rules: TransformRules,
    pub cleansing_rules: CleansingRules,

    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub rows_synced: u64,
    pub last_error: Option<String>,
    pub retries_used: u32,
}

impl SyncJob {
    /// Stable id derived from the job name, so restarts keep history attached
    pub fn id_for_name(name: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("syncpipe.job.{}", name).as_bytes())
    }

    pub fn new(
        name: impl Into<String>,
        source_id: impl Into<String>,
        cron_expression: impl Into<String>,
        pull: PullConfig,
    ) -> Self {
        let name = name.into();
        Self {
            id: Self::id_for_name(&name),
            name,
            source_id: source_id.into(),
            cron_expression: cron_expression.into(),
            priority: 0,
            enabled: true,
            pull,
            retry_policy: RetryPolicy::default(),
            timeout: Duration::from_secs(crate::config::DEFAULT_SYNC_JOB_TIMEOUT_SECS),
            transform_rules: TransformRules::default(),
            cleansing_rules: CleansingRules::default(),
            status: JobStatus::Pending,
            next_run_at: None,
            last_run_at: None,
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
            rows_synced: 0,
            last_error: None,
            retries_used: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_transform_rules(mut self, rules: TransformRules) -> Self {
        self.transform_rules = rules;
        self
    }

    pub fn with_cleansing_rules(mut self, rules: CleansingRules) -> Self {
        self.cleansing_rules = rules;
        self
    }

    /// Copy runtime state from a previously persisted version of this job
    pub fn adopt_state(&mut self, stored: &SyncJob) {
        self.status = match stored.status {
            // A run that was in flight when the process died did not finish
            JobStatus::Running => JobStatus::Pending,
            other => other,
        };
        self.next_run_at = stored.next_run_at;
        self.last_run_at = stored.last_run_at;
        self.total_runs = stored.total_runs;
        self.successful_runs = stored.successful_runs;
        self.failed_runs = stored.failed_runs;
        self.rows_synced = stored.rows_synced;
        self.last_error = stored.last_error.clone();
        self.retries_used = stored.retries_used;
        self.enabled = stored.enabled;
    }

    /// Failed with no retry scheduled; only `enable` revives it
    pub fn is_terminal(&self) -> bool {
        self.status == JobStatus::Failed && self.next_run_at.is_none()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|at| at <= now)
    }
}

/// Outcome of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    /// Job was disabled mid-run; batches committed before the check are kept
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("Unknown execution status: {}", other)),
        }
    }
}

/// Append-only history row, one per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub rows_synced: u64,
    pub rows_rejected: u64,
    pub rows_flagged: u64,
    pub bytes_processed: u64,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    /// Per-record error counts keyed by error kind
    pub error_counts: BTreeMap<String, u64>,
    pub retry_count: u32,
    pub checkpoint_value: Option<Value>,
}

/// Counters accumulated while a run progresses
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub batches: u32,
    /// Batches recognized by the idempotency guard as already committed
    pub batches_deduplicated: u32,
    pub rows_pulled: u64,
    pub rows_synced: u64,
    pub rows_rejected: u64,
    pub rows_flagged: u64,
    pub bytes_processed: u64,
    pub error_counts: BTreeMap<String, u64>,
    pub checkpoint_value: Option<Value>,
    /// Diagnostics attached to the execution row when the run fails
    #[serde(skip)]
    pub failure_details: Option<serde_json::Value>,
}

impl RunSummary {
    pub fn count_error(&mut self, kind: ErrorKind, n: u64) {
        if n > 0 {
            *self.error_counts.entry(kind.as_str().to_string()).or_insert(0) += n;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> SyncJob {
        SyncJob::new("orders", "crm", "*/5 * * * *", PullConfig::new("updated_at", FieldType::Datetime))
    }

    #[test]
    fn test_job_id_is_stable_per_name() {
        assert_eq!(job().id, SyncJob::id_for_name("orders"));
        assert_ne!(SyncJob::id_for_name("orders"), SyncJob::id_for_name("invoices"));
    }

    #[test]
    fn test_terminal_and_due() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut job = job();
        assert!(!job.is_due(now));

        job.next_run_at = Some(now);
        assert!(job.is_due(now));
        job.enabled = false;
        assert!(!job.is_due(now));

        job.status = JobStatus::Failed;
        job.next_run_at = None;
        assert!(job.is_terminal());
    }

    #[test]
    fn test_adopt_state_resets_running() {
        let mut stored = job();
        stored.status = JobStatus::Running;
        stored.total_runs = 7;

        let mut fresh = job().with_priority(3);
        fresh.adopt_state(&stored);
        assert_eq!(fresh.status, JobStatus::Pending);
        assert_eq!(fresh.total_runs, 7);
        assert_eq!(fresh.priority, 3);
    }

    #[test]
    fn test_timeout_serializes_as_seconds() {
        let job = job().with_timeout(Duration::from_secs(90));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["timeout"], 90);
    }

    #[test]
    fn test_summary_error_counts() {
        let mut summary = RunSummary::default();
        summary.count_error(ErrorKind::Transform, 2);
        summary.count_error(ErrorKind::Transform, 1);
        summary.count_error(ErrorKind::Validation, 0);
        assert_eq!(summary.error_counts.get("transform"), Some(&3));
        assert!(!summary.error_counts.contains_key("validation"));
    }
}
