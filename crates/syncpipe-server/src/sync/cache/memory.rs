use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use syncpipe_common::clock::{Clock, SystemClock};
use tokio::sync::Mutex;

use super::{CacheEntry, SemanticCache};
use crate::error::SyncResult;

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    /// Monotonic use counter; smallest is least recently used
    last_used: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    uses: u64,
}

impl Inner {
    fn touch(&mut self) -> u64 {
        self.uses += 1;
        self.uses
    }

    fn drop_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.entry.is_expired(now));
        before - self.slots.len()
    }

    fn evict_lru(&mut self) {
        let victim = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            tracing::trace!(key = %key, "Evicting least recently used cache entry");
            self.slots.remove(&key);
        }
    }
}

/// Bounded in-process LRU cache with per-entry TTL
pub struct MemoryCache {
    inner: Mutex<Inner>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache").field("capacity", &self.capacity).finish()
    }
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SemanticCache for MemoryCache {
    async fn get(&self, key: &str) -> SyncResult<Option<serde_json::Value>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        if inner.slots.get(key).is_some_and(|slot| slot.entry.is_expired(now)) {
            inner.slots.remove(key);
            return Ok(None);
        }

        let used = inner.touch();
        Ok(inner.slots.get_mut(key).map(|slot| {
            slot.last_used = used;
            slot.entry.hit_count += 1;
            slot.entry.last_hit_at = Some(now);
            slot.entry.value.clone()
        }))
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) -> SyncResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let used = inner.touch();

        if let Some(slot) = inner.slots.get_mut(key) {
            slot.entry.value = value;
            slot.entry.created_at = now;
            slot.entry.expires_at = now + ttl;
            slot.last_used = used;
            return Ok(());
        }

        if inner.slots.len() >= self.capacity && inner.drop_expired(now) == 0 {
            inner.evict_lru();
        }
        inner.slots.insert(
            key.to_string(),
            Slot {
                entry: CacheEntry {
                    key: key.to_string(),
                    value,
                    created_at: now,
                    expires_at: now + ttl,
                    hit_count: 0,
                    last_hit_at: None,
                },
                last_used: used,
            },
        );
        Ok(())
    }

    async fn entry(&self, key: &str) -> SyncResult<Option<CacheEntry>> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;
        Ok(inner
            .slots
            .get(key)
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| slot.entry.clone()))
    }

    async fn sweep(&self) -> SyncResult<u64> {
        let now = self.clock.now();
        Ok(self.inner.lock().await.drop_expired(now) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use syncpipe_common::clock::ManualClock;

    fn cache(capacity: usize) -> (MemoryCache, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        (MemoryCache::with_clock(capacity, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_hit_counting() {
        let (cache, _) = cache(4);
        assert!(cache.get("k").await.unwrap().is_none());
        // a miss leaves nothing behind
        assert!(cache.entry("k").await.unwrap().is_none());

        cache.put("k", json!({"rows": 3}), Duration::minutes(5)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!({"rows": 3})));
        cache.get("k").await.unwrap();

        let entry = cache.entry("k").await.unwrap().unwrap();
        assert_eq!(entry.hit_count, 2);
        assert!(entry.last_hit_at.is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (cache, clock) = cache(4);
        cache.put("a", json!(1), Duration::seconds(10)).await.unwrap();
        cache.put("b", json!(2), Duration::seconds(100)).await.unwrap();

        clock.advance(Duration::seconds(10));
        assert!(cache.get("a").await.unwrap().is_none());
        assert_eq!(cache.len().await, 1);

        cache.put("c", json!(3), Duration::seconds(1)).await.unwrap();
        clock.advance(Duration::seconds(5));
        assert_eq!(cache.sweep().await.unwrap(), 1);
        assert_eq!(cache.get("b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let (cache, _) = cache(2);
        cache.put("a", json!(1), Duration::minutes(1)).await.unwrap();
        cache.put("b", json!(2), Duration::minutes(1)).await.unwrap();
        cache.get("a").await.unwrap();
        cache.put("c", json!(3), Duration::minutes(1)).await.unwrap();

        assert!(cache.entry("b").await.unwrap().is_none());
        assert!(cache.entry("a").await.unwrap().is_some());
        assert!(cache.entry("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_cache_drops_expired_before_live_entries() {
        let (cache, clock) = cache(2);
        cache.put("short", json!(1), Duration::seconds(5)).await.unwrap();
        cache.put("long", json!(2), Duration::minutes(10)).await.unwrap();
        cache.get("short").await.unwrap();

        clock.advance(Duration::seconds(30));
        cache.put("new", json!(3), Duration::minutes(10)).await.unwrap();

        // "long" is the least recently used, but "short" has expired
        assert_eq!(cache.get("long").await.unwrap(), Some(json!(2)));
        assert_eq!(cache.get("new").await.unwrap(), Some(json!(3)));
        assert_eq!(cache.len().await, 2);
    }
}
