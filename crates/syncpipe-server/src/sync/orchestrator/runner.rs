//! One run of one job: the per-batch pull → transform → cleanse → commit loop
//!
//! The checkpoint only moves after the batch it covers is committed (or was
//! already committed by an earlier attempt). Anything that fails before that
//! point leaves the checkpoint untouched, so the next attempt re-pulls the
//! same range and the idempotency guard filters the replay.
//!
//! The job timeout is checked between batches and bounds each pull. Once a
//! batch holds its reservation, the sink write and checkpoint advance run to
//! completion.
//!
//! Records without a checkpoint value are returned together at the head of
//! a full pull. That batch is committed under a key derived from its content
//! and the rest of the run pulls positioned records only.

use chrono::Duration;
use syncpipe_common::checksum::content_hash;
use syncpipe_common::clock::Clock;
use syncpipe_common::{DataBatch, Value};
use tokio::time::Instant;

use super::state::JobHandle;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::sync::cache::{cache_key, SemanticCache};
use crate::sync::checkpoint::{CheckpointStore, CheckpointUpdate};
use crate::sync::cleanse::{CleansingEngine, CleansingResult};
use crate::sync::connector::{Connector, PullOutcome, PullRequest, ResumePosition};
use crate::sync::events::{EventBus, SyncEvent};
use crate::sync::idempotency::{IdempotencyGuard, Reservation};
use crate::sync::models::{RunSummary, SyncJob};
use crate::sync::sink::BatchSink;
use crate::sync::transform::{TransformPipeline, TransformResult, TransformRules};

/// Borrowed view of the orchestrator's components for a single run
pub(crate) struct BatchRunner<'a> {
    pub connector: &'a dyn Connector,
    pub checkpoints: &'a dyn CheckpointStore,
    pub guard: &'a dyn IdempotencyGuard,
    pub cache: &'a dyn SemanticCache,
    pub sink: &'a dyn BatchSink,
    pub pipeline: &'a TransformPipeline,
    pub cleanser: &'a CleansingEngine,
    pub events: &'a EventBus,
    pub clock: &'a dyn Clock,
    pub cache_ttl: Duration,
}

/// Idempotency key of the batch covering `(from, to]` of a job's checkpoint field
///
/// Derived from the checkpoint range rather than the batch id, so a re-pull of
/// the same range after a crash maps to the same key.
pub(crate) fn batch_key(job: &SyncJob, from: Option<&Value>, to: &Value) -> String {
    format!(
        "{}:{}:{}:{}..{}",
        job.id,
        job.source_id,
        job.pull.checkpoint_field,
        from.map(Value::to_text).unwrap_or_default(),
        to.to_text()
    )
}

/// Idempotency key of a batch whose records carry no checkpoint value
pub(crate) fn unpositioned_batch_key(job: &SyncJob, content_hash: &str) -> String {
    format!(
        "{}:{}:{}:unpositioned:{}",
        job.id, job.source_id, job.pull.checkpoint_field, content_hash
    )
}

/// What a processed batch did to the run's position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchProgress {
    Advanced,
    Unchanged,
    /// Committed records that have no checkpoint value
    Unpositioned,
}

impl BatchRunner<'_> {
    /// Pull until the source is drained, the batch limit is hit, the job is
    /// disabled or `deadline` passes
    ///
    /// `summary` is updated as batches complete, so it stays meaningful when
    /// the run fails part way.
    pub async fn run(
        &self,
        job: &SyncJob,
        handle: &JobHandle,
        summary: &mut RunSummary,
        deadline: Instant,
    ) -> SyncResult<()> {
        let field = job.pull.checkpoint_field.as_str();
        let value_type = job.pull.checkpoint_type;
        let mut sequence: u32 = 0;
        let mut skip_unpositioned = false;

        loop {
            if handle.is_disabled() {
                tracing::info!(job = %job.name, batches = summary.batches, "Job disabled; stopping between batches");
                return Err(SyncError::Cancelled(job.id));
            }
            if job.pull.max_batches_per_run.is_some_and(|max| summary.batches >= max) {
                tracing::debug!(job = %job.name, "Batch limit for this run reached");
                return Ok(());
            }
            self.check_deadline(job, deadline)?;

            let current = self.checkpoints.get(&job.source_id, field).await?;
            let from = current.as_ref().map(|c| c.last_value.clone());
            let mut position = match &from {
                Some(value) => ResumePosition::after(field, value.clone()),
                None => ResumePosition::full(field),
            }
            .typed(value_type);
            if skip_unpositioned {
                position = position.values_only();
            }
            let request = PullRequest {
                position,
                limit: job.pull.batch_size,
                sequence,
                requested_at: self.clock.now(),
            };

            let pulled = tokio::time::timeout_at(deadline, self.connector.pull(&request))
                .await
                .map_err(|_| SyncError::JobTimeout(job.timeout))??;
            let batch = match pulled {
                PullOutcome::Batch(batch) if !batch.is_empty() => batch,
                _ => {
                    tracing::debug!(job = %job.name, sequence, "Source drained");
                    return Ok(());
                },
            };

            summary.batches += 1;
            summary.rows_pulled += batch.len() as u64;
            summary.bytes_processed += batch.approx_bytes() as u64;

            match self.process_batch(job, &batch, from.as_ref(), summary, deadline).await? {
                BatchProgress::Unpositioned => skip_unpositioned = true,
                BatchProgress::Unchanged => return Ok(()),
                BatchProgress::Advanced if batch.len() < job.pull.batch_size => return Ok(()),
                BatchProgress::Advanced => {},
            }
            sequence += 1;
        }
    }

    fn check_deadline(&self, job: &SyncJob, deadline: Instant) -> SyncResult<()> {
        if Instant::now() >= deadline {
            tracing::warn!(job = %job.name, timeout = ?job.timeout, "Job timeout reached between batches");
            return Err(SyncError::JobTimeout(job.timeout));
        }
        Ok(())
    }

    async fn process_batch(
        &self,
        job: &SyncJob,
        batch: &DataBatch,
        from: Option<&Value>,
        summary: &mut RunSummary,
        deadline: Instant,
    ) -> SyncResult<BatchProgress> {
        let field = job.pull.checkpoint_field.as_str();

        let transformed = self.transform(job, batch, summary).await?;
        summary.rows_rejected += transformed.errors.len() as u64;
        for error in &transformed.errors {
            summary.count_error(error.kind, 1);
        }

        let now = self.clock.now();
        let cleansed = self.cleanser.cleanse(&transformed.batch, &job.cleansing_rules, now)?;
        summary.rows_rejected += cleansed.rejected.len() as u64;
        summary.rows_flagged += cleansed.flagged_count() as u64;
        summary.count_error(ErrorKind::Validation, cleansed.rejected.len() as u64);

        let hash = content_hash(&(&batch.records, &job.transform_rules, &job.cleansing_rules))?;

        // Compared as the checkpoint type, so "+05:00" and "Z" timestamps order by instant
        let Some(max) = batch.max_value_as(field, job.pull.checkpoint_type) else {
            let key = unpositioned_batch_key(job, &hash);
            tracing::warn!(
                job = %job.name,
                field,
                rows = batch.len(),
                "Batch has no checkpoint values; committing by content"
            );
            self.check_deadline(job, deadline)?;
            self.commit(job, batch, &cleansed, &key, &hash, summary).await?;
            self.publish_committed(job, batch, &cleansed, None);
            return Ok(BatchProgress::Unpositioned);
        };

        let key = batch_key(job, from, &max);
        self.check_deadline(job, deadline)?;
        self.commit(job, batch, &cleansed, &key, &hash, summary).await?;

        let checkpoint = self
            .checkpoints
            .advance(CheckpointUpdate {
                source_id: job.source_id.clone(),
                field: field.to_string(),
                value: max.clone(),
                value_type: job.pull.checkpoint_type,
                rows_pulled: batch.len() as u64,
                monotonic: job.pull.monotonic,
                pulled_at: self.clock.now(),
            })
            .await?;
        summary.checkpoint_value = Some(checkpoint.last_value.clone());
        self.publish_committed(job, batch, &cleansed, Some(checkpoint.last_value));

        Ok(
            if from.is_none_or(|previous| max.compare(previous) == Some(std::cmp::Ordering::Greater)) {
                BatchProgress::Advanced
            } else {
                BatchProgress::Unchanged
            },
        )
    }

    /// Reserve `key`, write the clean records and mark the reservation committed
    async fn commit(
        &self,
        job: &SyncJob,
        batch: &DataBatch,
        cleansed: &CleansingResult,
        key: &str,
        hash: &str,
        summary: &mut RunSummary,
    ) -> SyncResult<()> {
        if cleansed.clean_batch.is_empty() {
            return Ok(());
        }
        let rows = cleansed.clean_batch.len() as u64;

        match self.guard.reserve(key, hash, rows).await?.or_conflict(key, hash)? {
            Reservation::Reserved => match self.sink.commit(&cleansed.clean_batch, key).await {
                Ok(receipt) => {
                    summary.rows_synced += receipt.rows_written;
                    self.guard.mark_committed(key, hash).await?;
                },
                Err(e) => {
                    if let Err(release_err) = self.guard.release(key, hash).await {
                        tracing::error!(key = %key, error = %release_err, "Failed to release reservation");
                    }
                    return Err(e);
                },
            },
            _ => {
                tracing::info!(job = %job.name, key = %key, "Batch already committed; skipping sink write");
                summary.batches_deduplicated += 1;
            },
        }

        if let Some(window) = job.cleansing_rules.dedup.as_ref().and_then(|d| d.recent_window()) {
            self.cleanser
                .window()
                .record(&batch.source_id, cleansed.dedup_keys.iter().cloned(), self.clock.now(), window);
        }
        Ok(())
    }

    fn publish_committed(&self, job: &SyncJob, batch: &DataBatch, cleansed: &CleansingResult, checkpoint: Option<Value>) {
        tracing::info!(
            job = %job.name,
            batch_id = %batch.batch_id,
            sequence = batch.sequence,
            rows = cleansed.clean_batch.len(),
            checkpoint = %checkpoint.as_ref().map(syncpipe_common::Value::to_text).unwrap_or_default(),
            "Batch committed"
        );
        self.events.publish(SyncEvent::BatchCommitted {
            job_id: job.id,
            source_id: job.source_id.clone(),
            batch_id: batch.batch_id,
            sequence: batch.sequence,
            rows: cleansed.clean_batch.len() as u64,
            checkpoint_value: checkpoint,
            committed_at: self.clock.now(),
        });
    }

    /// Transform through the semantic cache
    async fn transform(&self, job: &SyncJob, batch: &DataBatch, summary: &mut RunSummary) -> SyncResult<TransformResult> {
        let rules = &job.transform_rules;
        let key = self.transform_cache_key(batch, rules);

        if let Some(key) = &key {
            match self.cache.get(key).await {
                Ok(Some(cached)) => match serde_json::from_value::<TransformResult>(cached) {
                    Ok(hit) => {
                        tracing::debug!(batch_id = %batch.batch_id, "Transform cache hit");
                        return Ok(TransformResult {
                            batch: batch.with_records(hit.batch.records),
                            errors: hit.errors,
                        });
                    },
                    Err(e) => tracing::warn!(error = %e, "Discarding unreadable cache entry"),
                },
                Ok(None) => {},
                Err(e) => tracing::warn!(error = %e, "Cache lookup failed; continuing uncached"),
            }
        }

        let result = match self.pipeline.run(batch, rules) {
            Ok(result) => result,
            Err(failure) => {
                summary.count_error(ErrorKind::Transform, 1);
                summary.failure_details = Some(serde_json::json!({
                    "stage": failure.stage.as_str(),
                    "row_id": failure.row_id,
                    "batch_id": batch.batch_id,
                    "partial": failure.partial.as_ref().map(|p| &p.records),
                }));
                return Err(failure.into());
            },
        };

        if let Some(key) = &key {
            match serde_json::to_value(&result) {
                Ok(value) => {
                    if let Err(e) = self.cache.put(key, value, self.cache_ttl).await {
                        tracing::warn!(error = %e, "Cache write failed; continuing uncached");
                    }
                },
                Err(e) => tracing::warn!(error = %e, "Transform result not cacheable"),
            }
        }
        Ok(result)
    }

    fn transform_cache_key(&self, batch: &DataBatch, rules: &TransformRules) -> Option<String> {
        let metadata = rules.uses_batch_metadata().then_some((batch.sequence, batch.produced_at));
        match cache_key(&(&batch.source_id, &batch.records, metadata), rules) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "Could not derive cache key; transforming uncached");
                None
            },
        }
    }
}
