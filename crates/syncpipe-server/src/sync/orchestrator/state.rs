//! Per-job runtime state and the pure status transitions

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

use super::schedule::CronSchedule;
use crate::error::SyncError;
use crate::sync::models::{JobStatus, RunSummary, SyncJob};

pub(crate) struct JobHandle {
    pub job: RwLock<SyncJob>,
    pub schedule: CronSchedule,
    /// Held for the whole run; `try_lock` failing means a run is in flight
    pub run_lock: Mutex<()>,
    /// Checked before and between batches
    pub disabled: AtomicBool,
}

impl JobHandle {
    pub fn new(job: SyncJob, schedule: CronSchedule) -> Self {
        let disabled = AtomicBool::new(!job.enabled);
        Self {
            job: RwLock::new(job),
            schedule,
            run_lock: Mutex::new(()),
            disabled,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }
}

fn record_run(job: &mut SyncJob, summary: &RunSummary) {
    job.total_runs += 1;
    job.rows_synced += summary.rows_synced;
}

pub(crate) fn apply_success(job: &mut SyncJob, schedule: &CronSchedule, summary: &RunSummary, now: DateTime<Utc>) {
    record_run(job, summary);
    job.successful_runs += 1;
    job.status = JobStatus::Succeeded;
    job.last_error = None;
    job.retries_used = 0;
    job.next_run_at = schedule.next_after(now);
}

/// Returns whether a retry was scheduled
pub(crate) fn apply_failure(job: &mut SyncJob, error: &SyncError, summary: &RunSummary, now: DateTime<Utc>) -> bool {
    record_run(job, summary);
    job.failed_runs += 1;
    job.status = JobStatus::Failed;
    job.last_error = Some(error.to_string());

    if error.is_retryable() && job.retry_policy.can_retry(job.retries_used) {
        let delay = job.retry_policy.delay_for(job.retries_used);
        job.next_run_at = chrono::Duration::from_std(delay).ok().and_then(|d| now.checked_add_signed(d));
        job.retries_used += 1;
        true
    } else {
        job.next_run_at = None;
        false
    }
}

/// Disabled mid-run: committed batches stay, the job waits to be re-enabled
pub(crate) fn apply_cancelled(job: &mut SyncJob, summary: &RunSummary) {
    record_run(job, summary);
    job.status = JobStatus::Pending;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sync::models::PullConfig;
    use crate::sync::orchestrator::RetryPolicy;
    use chrono::{Duration, TimeZone};
    use syncpipe_common::FieldType;

    fn job() -> SyncJob {
        SyncJob::new("orders", "crm", "0 * * * *", PullConfig::new("id", FieldType::Int)).with_retry_policy(
            RetryPolicy::new(std::time::Duration::from_secs(30), std::time::Duration::from_secs(100), 3),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_failure_backoff_sequence() {
        let mut job = job();
        let err = SyncError::connection("refused");
        let summary = RunSummary::default();

        let delays: Vec<i64> = (0..4)
            .map(|_| {
                apply_failure(&mut job, &err, &summary, now());
                job.next_run_at.map(|at| (at - now()).num_seconds()).unwrap_or(-1)
            })
            .collect();
        assert_eq!(delays, vec![30, 60, 100, -1]);
        assert_eq!(job.failed_runs, 4);
        assert!(job.is_terminal());
    }

    #[test]
    fn test_authentication_is_not_retried() {
        let mut job = job();
        assert!(!apply_failure(&mut job, &SyncError::authentication("bad token"), &RunSummary::default(), now()));
        assert!(job.is_terminal());
        assert_eq!(job.retries_used, 0);
    }

    #[test]
    fn test_success_resets_retries_and_schedules_cron() {
        let mut job = job();
        apply_failure(&mut job, &SyncError::connection("x"), &RunSummary::default(), now());
        let schedule = CronSchedule::parse(&job.cron_expression).unwrap();
        let summary = RunSummary {
            rows_synced: 12,
            ..Default::default()
        };
        apply_success(&mut job, &schedule, &summary, now() + Duration::seconds(30));

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.retries_used, 0);
        assert_eq!(job.rows_synced, 12);
        assert_eq!(job.total_runs, 2);
        assert!(job.last_error.is_none());
        assert_eq!(job.next_run_at, Some(Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()));
    }
}
