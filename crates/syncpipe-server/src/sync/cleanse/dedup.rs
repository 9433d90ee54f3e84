//! Deduplication within a batch and against a recent-key window

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use syncpipe_common::DataRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    pub key_fields: Vec<String>,
    /// Reject keys committed by an earlier batch within this many seconds
    #[serde(default)]
    pub recent_window_secs: Option<u64>,
}

impl DedupConfig {
    pub fn key_for(&self, record: &DataRecord) -> String {
        self.key_fields
            .iter()
            .map(|field| record.value_or_null(field).to_text())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }

    pub fn recent_window(&self) -> Option<Duration> {
        self.recent_window_secs
            .map(|secs| Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000)))
    }
}

/// Candidate ordering: higher score, then newer source timestamp, then earlier position
fn better(a: (f64, Option<DateTime<Utc>>, usize), b: (f64, Option<DateTime<Utc>>, usize)) -> bool {
    match a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal) {
        Ordering::Greater => return true,
        Ordering::Less => return false,
        Ordering::Equal => {},
    }
    // None sorts oldest
    match a.1.cmp(&b.1) {
        Ordering::Greater => return true,
        Ordering::Less => return false,
        Ordering::Equal => {},
    }
    a.2 < b.2
}

/// Pick one survivor per key
///
/// Returns, for each input index, `None` if it survives or `Some(winner)`
/// with the index of the record that beat it.
pub(crate) fn select_survivors(keys: &[String], records: &[DataRecord], scores: &[f64]) -> Vec<Option<usize>> {
    let mut winners: HashMap<&str, usize> = HashMap::new();
    for (index, key) in keys.iter().enumerate() {
        let candidate = (scores[index], records[index].source_ts, index);
        winners
            .entry(key.as_str())
            .and_modify(|current| {
                let incumbent = (scores[*current], records[*current].source_ts, *current);
                if better(candidate, incumbent) {
                    *current = index;
                }
            })
            .or_insert(index);
    }

    keys.iter()
        .enumerate()
        .map(|(index, key)| match winners.get(key.as_str()) {
            Some(&winner) if winner != index => Some(winner),
            _ => None,
        })
        .collect()
}

/// Dedup keys recently committed per source
///
/// Kept in process memory; after a restart the window starts empty and
/// the idempotency guard remains the cross-run safety net.
#[derive(Debug, Default)]
pub struct RecentKeyWindow {
    entries: Mutex<BTreeMap<(String, String), DateTime<Utc>>>,
}

impl RecentKeyWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, source_id: &str, key: &str, now: DateTime<Utc>) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        entries
            .get(&(source_id.to_string(), key.to_string()))
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Remember committed keys until `now + window`, dropping expired ones
    pub fn record<I>(&self, source_id: &str, keys: I, now: DateTime<Utc>, window: Duration)
    where
        I: IntoIterator<Item = String>,
    {
        let Ok(mut entries) = self.entries.lock() else {
            tracing::warn!(source_id = %source_id, "Recent key window poisoned; keys not recorded");
            return;
        };
        entries.retain(|_, expires_at| *expires_at > now);
        let expires_at = now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);
        for key in keys {
            entries.insert((source_id.to_string(), key), expires_at);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
