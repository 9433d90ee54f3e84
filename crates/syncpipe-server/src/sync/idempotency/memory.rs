use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use syncpipe_common::clock::{Clock, SystemClock};
use tokio::sync::Mutex;

use super::{IdempotencyGuard, IdempotencyRecord, RecordState, Reservation};
use crate::error::SyncResult;

/// Process-local guard; reservations live as long as the process
pub struct MemoryIdempotencyGuard {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl std::fmt::Debug for MemoryIdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryIdempotencyGuard").field("ttl", &self.ttl).finish()
    }
}

impl MemoryIdempotencyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            ttl,
        }
    }
}

#[async_trait]
impl IdempotencyGuard for MemoryIdempotencyGuard {
    async fn reserve(&self, key: &str, content_hash: &str, rows: u64) -> SyncResult<Reservation> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(key).filter(|r| !r.is_expired(now)) {
            let reservation = existing.reservation_for(content_hash);
            if reservation != Reservation::Reserved {
                return Ok(reservation);
            }
            tracing::warn!(key = %key, "Re-claiming reservation that never committed");
        }

        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                content_hash: content_hash.to_string(),
                rows_received: rows,
                state: RecordState::Reserved,
                created_at: now,
                committed_at: None,
                expires_at: now + self.ttl,
            },
        );
        Ok(Reservation::Reserved)
    }

    async fn mark_committed(&self, key: &str, content_hash: &str) -> SyncResult<bool> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        match records.get_mut(key).filter(|r| r.content_hash == content_hash) {
            Some(record) => {
                record.state = RecordState::Committed;
                record.committed_at.get_or_insert(now);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn release(&self, key: &str, content_hash: &str) -> SyncResult<bool> {
        let mut records = self.records.lock().await;
        if records
            .get(key)
            .is_some_and(|r| r.content_hash == content_hash && !r.is_committed())
        {
            records.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, key: &str) -> SyncResult<Option<IdempotencyRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn purge_expired(&self) -> SyncResult<u64> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use syncpipe_common::clock::ManualClock;

    fn guard() -> (MemoryIdempotencyGuard, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        (
            MemoryIdempotencyGuard::with_clock(Duration::hours(1), Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn test_same_payload_commits_once() {
        let (guard, _) = guard();
        assert_eq!(guard.reserve("k", "h1", 3).await.unwrap(), Reservation::Reserved);
        assert!(guard.mark_committed("k", "h1").await.unwrap());
        for _ in 0..5 {
            assert_eq!(guard.reserve("k", "h1", 3).await.unwrap(), Reservation::AlreadyCommitted);
        }
        let record = guard.get("k").await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Committed);
        assert!(record.committed_at.is_some());
    }

    #[tokio::test]
    async fn test_uncommitted_reservation_is_reclaimed() {
        let (guard, _) = guard();
        assert_eq!(guard.reserve("k", "h1", 3).await.unwrap(), Reservation::Reserved);
        // the attempt holding the reservation died before its sink write finished
        assert_eq!(guard.reserve("k", "h1", 3).await.unwrap(), Reservation::Reserved);
        assert_eq!(guard.get("k").await.unwrap().unwrap().state, RecordState::Reserved);

        assert!(!guard.mark_committed("k", "other").await.unwrap());
        assert!(guard.mark_committed("k", "h1").await.unwrap());
        assert!(!guard.release("k", "h1").await.unwrap(), "committed records are never released");
        assert_eq!(guard.reserve("k", "h1", 3).await.unwrap(), Reservation::AlreadyCommitted);
    }

    #[tokio::test]
    async fn test_different_payload_conflicts_without_overwrite() {
        let (guard, _) = guard();
        guard.reserve("k", "h1", 3).await.unwrap();
        assert_eq!(
            guard.reserve("k", "h2", 3).await.unwrap(),
            Reservation::Conflict {
                stored_hash: "h1".into()
            }
        );
        assert_eq!(guard.get("k").await.unwrap().unwrap().content_hash, "h1");
    }

    #[tokio::test]
    async fn test_expired_key_can_be_reused() {
        let (guard, clock) = guard();
        guard.reserve("k", "h1", 3).await.unwrap();
        clock.advance(Duration::hours(2));
        assert_eq!(guard.reserve("k", "h2", 1).await.unwrap(), Reservation::Reserved);
        assert_eq!(guard.get("k").await.unwrap().unwrap().rows_received, 1);
    }

    #[tokio::test]
    async fn test_release_and_purge() {
        let (guard, clock) = guard();
        guard.reserve("a", "h", 1).await.unwrap();
        guard.reserve("b", "h", 1).await.unwrap();

        assert!(!guard.release("a", "other").await.unwrap());
        assert!(guard.release("a", "h").await.unwrap());
        assert_eq!(guard.reserve("a", "h2", 1).await.unwrap(), Reservation::Reserved);

        clock.advance(Duration::hours(2));
        assert_eq!(guard.purge_expired().await.unwrap(), 2);
        assert!(guard.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_reserve_has_single_winner() {
        let (guard, _) = guard();
        let guard = Arc::new(guard);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let guard = guard.clone();
                tokio::spawn(async move { guard.reserve("k", &format!("h{}", i), 1).await.unwrap() })
            })
            .collect();

        let mut reserved = 0;
        for handle in handles {
            if handle.await.unwrap() == Reservation::Reserved {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 1);
    }
}
