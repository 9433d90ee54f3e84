//! Semantic result cache
//!
//! Stores expensive derived results keyed by `hash(input) + ":" + hash(config)`.
//! Expired entries are dropped lazily on access and by [`SemanticCache::sweep`].
//! Misses never write a negative entry. Backend failures surface as
//! [`SyncError::CacheUnavailable`](crate::error::SyncError::CacheUnavailable)
//! so callers can log and carry on uncached.

mod memory;
mod postgres;

pub use memory::MemoryCache;
pub use postgres::PgCache;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use syncpipe_common::checksum::fast_hash;

use crate::error::SyncResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub last_hit_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait SemanticCache: Send + Sync {
    /// Live value for `key`; a hit bumps the hit counter and last-hit time
    async fn get(&self, key: &str) -> SyncResult<Option<serde_json::Value>>;

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) -> SyncResult<()>;

    /// Inspect an entry without counting a hit
    async fn entry(&self, key: &str) -> SyncResult<Option<CacheEntry>>;

    /// Remove expired entries, returning how many were removed
    async fn sweep(&self) -> SyncResult<u64>;
}

/// Cache key from the normalized input and the configuration that shapes the result
pub fn cache_key<I, C>(input: &I, config: &C) -> SyncResult<String>
where
    I: Serialize + ?Sized,
    C: Serialize + ?Sized,
{
    Ok(format!("{}:{}", fast_hash(input)?, fast_hash(config)?))
}
