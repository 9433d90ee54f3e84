//! `idempotency_records` table

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use syncpipe_common::clock::{Clock, SystemClock};

use super::{IdempotencyGuard, IdempotencyRecord, RecordState, Reservation};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, sqlx::FromRow)]
struct IdempotencyRow {
    key: String,
    content_hash: String,
    rows_received: i64,
    state: String,
    created_at: DateTime<Utc>,
    committed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        IdempotencyRecord {
            key: row.key,
            content_hash: row.content_hash,
            rows_received: u64::try_from(row.rows_received).unwrap_or(0),
            state: RecordState::parse(&row.state),
            created_at: row.created_at,
            committed_at: row.committed_at,
            expires_at: row.expires_at,
        }
    }
}

pub struct PgIdempotencyGuard {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl std::fmt::Debug for PgIdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgIdempotencyGuard").field("ttl", &self.ttl).finish()
    }
}

impl PgIdempotencyGuard {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self::with_clock(pool, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock, ttl }
    }
}

#[async_trait]
impl IdempotencyGuard for PgIdempotencyGuard {
    async fn reserve(&self, key: &str, content_hash: &str, rows: u64) -> SyncResult<Reservation> {
        let now = self.clock.now();

        // The upsert takes over an expired row or a same-hash row that never
        // committed. A concurrent release can remove the row between the
        // insert and the lookup; one more attempt then wins the insert.
        for _ in 0..2 {
            let inserted: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO idempotency_records
                    (key, content_hash, rows_received, state, created_at, committed_at, expires_at)
                VALUES ($1, $2, $3, 'reserved', $4, NULL, $5)
                ON CONFLICT (key) DO UPDATE SET
                    content_hash = EXCLUDED.content_hash,
                    rows_received = EXCLUDED.rows_received,
                    state = 'reserved',
                    created_at = EXCLUDED.created_at,
                    committed_at = NULL,
                    expires_at = EXCLUDED.expires_at
                WHERE idempotency_records.expires_at <= EXCLUDED.created_at
                   OR (idempotency_records.state = 'reserved'
                       AND idempotency_records.content_hash = EXCLUDED.content_hash)
                RETURNING key
                "#,
            )
            .bind(key)
            .bind(content_hash)
            .bind(i64::try_from(rows).unwrap_or(i64::MAX))
            .bind(now)
            .bind(now + self.ttl)
            .fetch_optional(&self.pool)
            .await?;

            if inserted.is_some() {
                return Ok(Reservation::Reserved);
            }

            let stored: Option<(String, String)> =
                sqlx::query_as("SELECT content_hash, state FROM idempotency_records WHERE key = $1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;

            match stored {
                Some((stored_hash, _)) if stored_hash != content_hash => {
                    return Ok(Reservation::Conflict { stored_hash })
                },
                Some((_, state)) if RecordState::parse(&state) == RecordState::Committed => {
                    return Ok(Reservation::AlreadyCommitted)
                },
                // row changed between the two statements
                Some(_) | None => continue,
            }
        }

        Err(SyncError::Sink(format!("Could not reserve idempotency key '{}'", key)))
    }

    async fn mark_committed(&self, key: &str, content_hash: &str) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET state = 'committed', committed_at = COALESCE(committed_at, $3)
            WHERE key = $1 AND content_hash = $2
            "#,
        )
        .bind(key)
        .bind(content_hash)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, content_hash: &str) -> SyncResult<bool> {
        let result = sqlx::query(
            "DELETE FROM idempotency_records WHERE key = $1 AND content_hash = $2 AND state = 'reserved'",
        )
            .bind(key)
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: &str) -> SyncResult<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(
            r#"
            SELECT key, content_hash, rows_received, state, created_at, committed_at, expires_at
            FROM idempotency_records WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(IdempotencyRecord::from))
    }

    async fn purge_expired(&self) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        tracing::debug!(purged = result.rows_affected(), "Expired idempotency records purged");
        Ok(result.rows_affected())
    }
}
