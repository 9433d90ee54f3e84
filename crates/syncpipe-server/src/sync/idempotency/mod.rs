//! Idempotency guard for sink commits
//!
//! A batch is committed under a key derived from its job, source and
//! checkpoint range. A record moves from `Reserved` (claimed, sink write
//! pending) to `Committed` (sink write done). `reserve` is a single
//! compare-and-set: the first caller wins, a repeat with the same content
//! hash short-circuits once committed, and a repeat with a different hash
//! is a conflict. A same-hash reservation that never committed belongs to
//! an attempt that died mid-commit and is claimed again. Expired keys may
//! be reused.

mod memory;
mod postgres;

pub use memory::MemoryIdempotencyGuard;
pub use postgres::PgIdempotencyGuard;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reservation {
    /// Key is now held by this caller, fresh or re-claimed; proceed with the commit
    Reserved,
    /// Same key and content already committed; skip the commit
    AlreadyCommitted,
    /// Same key, different content
    Conflict { stored_hash: String },
}

impl Reservation {
    /// Turn a conflict into [`SyncError::DuplicateKeyConflict`]
    pub fn or_conflict(self, key: &str, submitted_hash: &str) -> SyncResult<Reservation> {
        match self {
            Reservation::Conflict { stored_hash } => Err(SyncError::DuplicateKeyConflict {
                key: key.to_string(),
                stored_hash,
                submitted_hash: submitted_hash.to_string(),
            }),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Reserved,
    Committed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Reserved => "reserved",
            RecordState::Committed => "committed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "committed" => RecordState::Committed,
            _ => RecordState::Reserved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub content_hash: String,
    pub rows_received: u64,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_committed(&self) -> bool {
        self.state == RecordState::Committed
    }

    /// What a new `reserve` of `key` with `content_hash` gets while this record is live
    pub fn reservation_for(&self, content_hash: &str) -> Reservation {
        match (self.content_hash == content_hash, self.state) {
            (true, RecordState::Committed) => Reservation::AlreadyCommitted,
            (true, RecordState::Reserved) => Reservation::Reserved,
            (false, _) => Reservation::Conflict {
                stored_hash: self.content_hash.clone(),
            },
        }
    }
}

#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    async fn reserve(&self, key: &str, content_hash: &str, rows: u64) -> SyncResult<Reservation>;

    /// Record that the sink write for a reservation finished
    async fn mark_committed(&self, key: &str, content_hash: &str) -> SyncResult<bool>;

    /// Drop a reservation whose commit failed; only removes an uncommitted matching hash
    async fn release(&self, key: &str, content_hash: &str) -> SyncResult<bool>;

    async fn get(&self, key: &str) -> SyncResult<Option<IdempotencyRecord>>;

    /// Delete expired records, returning how many were removed
    async fn purge_expired(&self) -> SyncResult<u64>;
}
