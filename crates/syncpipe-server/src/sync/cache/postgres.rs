//! `semantic_cache` table

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;
use syncpipe_common::clock::{Clock, SystemClock};

use super::{CacheEntry, SemanticCache};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    key: String,
    value: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    hit_count: i64,
    last_hit_at: Option<DateTime<Utc>>,
}

impl From<CacheRow> for CacheEntry {
    fn from(row: CacheRow) -> Self {
        CacheEntry {
            key: row.key,
            value: row.value.0,
            created_at: row.created_at,
            expires_at: row.expires_at,
            hit_count: u64::try_from(row.hit_count).unwrap_or(0),
            last_hit_at: row.last_hit_at,
        }
    }
}

fn unavailable(e: sqlx::Error) -> SyncError {
    SyncError::CacheUnavailable(e.to_string())
}

pub struct PgCache {
    pool: PgPool,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PgCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgCache").field("capacity", &self.capacity).finish()
    }
}

impl PgCache {
    pub fn new(pool: PgPool, capacity: usize) -> Self {
        Self::with_clock(pool, capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            capacity: capacity.max(1),
            clock,
        }
    }
}

#[async_trait]
impl SemanticCache for PgCache {
    async fn get(&self, key: &str) -> SyncResult<Option<serde_json::Value>> {
        let now = self.clock.now();
        let hit: Option<Json<serde_json::Value>> = sqlx::query_scalar(
            r#"
            UPDATE semantic_cache
            SET hit_count = hit_count + 1, last_hit_at = $2
            WHERE key = $1 AND expires_at > $2
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        if hit.is_none() {
            sqlx::query("DELETE FROM semantic_cache WHERE key = $1 AND expires_at <= $2")
                .bind(key)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        }

        Ok(hit.map(|json| json.0))
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) -> SyncResult<()> {
        let now = self.clock.now();
        sqlx::query(
            r#"
            INSERT INTO semantic_cache (key, value, created_at, expires_at, hit_count, last_hit_at)
            VALUES ($1, $2, $3, $4, 0, NULL)
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(Json(&value))
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        let evicted = sqlx::query(
            r#"
            DELETE FROM semantic_cache WHERE key IN (
                SELECT key FROM semantic_cache
                ORDER BY COALESCE(last_hit_at, created_at) DESC
                OFFSET $1
            )
            "#,
        )
        .bind(i64::try_from(self.capacity).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if evicted.rows_affected() > 0 {
            tracing::debug!(evicted = evicted.rows_affected(), "Cache entries evicted");
        }
        Ok(())
    }

    async fn entry(&self, key: &str) -> SyncResult<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT key, value, created_at, expires_at, hit_count, last_hit_at
            FROM semantic_cache
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.map(CacheEntry::from))
    }

    async fn sweep(&self) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM semantic_cache WHERE expires_at <= $1")
            .bind(self.clock.now())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected())
    }
}
