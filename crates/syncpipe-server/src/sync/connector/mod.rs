//! Source connectors
//!
//! A [`Connector`] pulls one bounded batch of records from an external
//! source, starting strictly after a resume position. Records come back
//! ordered by the checkpoint field (row id breaks ties) so the caller can
//! derive a monotonic checkpoint from the batch maximum. Connectors never
//! write checkpoints themselves.

mod file;
mod http;
mod memory;
mod registry;

pub use file::{CsvConnector, JsonLinesConnector};
pub use http::HttpConnector;
pub use memory::MemoryConnector;
pub use registry::{ConnectorRegistry, SourceConfig, SourceKind};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use syncpipe_common::{DataBatch, DataRecord, FieldType, Value};

use crate::error::SyncResult;

/// Where the next pull starts
///
/// `after == None` means a full pull from the beginning. Source values of
/// `field` are coerced to `value_type` before they are ordered or compared.
/// Records without a usable value ("unpositioned") can only be returned by
/// a full pull; `values_only` drops them once they have been delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePosition {
    pub field: String,
    pub after: Option<Value>,
    pub value_type: Option<FieldType>,
    pub values_only: bool,
}

impl ResumePosition {
    pub fn full(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            after: None,
            value_type: None,
            values_only: false,
        }
    }

    /// Strictly after `value`, typed like `value`
    pub fn after(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value_type: value.field_type(),
            after: Some(value),
            values_only: true,
        }
    }

    pub fn typed(mut self, value_type: FieldType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn values_only(mut self) -> Self {
        self.values_only = true;
        self
    }

    pub fn is_full(&self) -> bool {
        self.after.is_none()
    }

    /// The record's position value, or `None` when it has none usable
    pub fn key_of(&self, record: &DataRecord) -> Option<Value> {
        record.typed_value(&self.field, self.value_type)
    }
}

/// A single pull request issued by the orchestrator
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub position: ResumePosition,
    /// Target number of records; a batch may run over to keep equal checkpoint values together
    pub limit: usize,
    /// Batch position within the current run
    pub sequence: u32,
    /// Stamped on the produced batch as `produced_at`
    pub requested_at: DateTime<Utc>,
}

impl PullRequest {
    /// Wrap records pulled for this request into a batch
    pub fn batch(&self, source_id: &str, records: Vec<DataRecord>) -> DataBatch {
        DataBatch::new(source_id, self.sequence, self.requested_at, records)
    }

    /// Batch, or end of stream when nothing is left
    pub fn outcome(&self, source_id: &str, records: Vec<DataRecord>) -> PullOutcome {
        if records.is_empty() {
            PullOutcome::EndOfStream
        } else {
            PullOutcome::Batch(self.batch(source_id, records))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    Batch(DataBatch),
    EndOfStream,
}

/// Pluggable source adapter
///
/// Transport failures must surface as `SyncError::Connection` (retried) and
/// rejected credentials as `SyncError::Authentication` (not retried).
#[async_trait]
pub trait Connector: Send + Sync {
    fn source_id(&self) -> &str;

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullOutcome>;
}

/// Missing keys sort before every value
fn order_keys(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(l), Some(r)) => l.compare(r).unwrap_or(Ordering::Equal),
    }
}

fn same_key(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(l), Some(r)) => l.compare(r) == Some(Ordering::Equal),
        _ => false,
    }
}

/// Sort by typed position value, filter strictly after the resume value and cut a batch
///
/// Records sharing the boundary value are kept in the same batch so the
/// next strictly-after pull cannot skip them. Unpositioned records sort
/// first and count as one shared value, so a full pull returns all of them
/// in its first batch.
pub(crate) fn select_after(records: Vec<DataRecord>, position: &ResumePosition, limit: usize) -> Vec<DataRecord> {
    let mut keyed: Vec<(Option<Value>, DataRecord)> =
        records.into_iter().map(|record| (position.key_of(&record), record)).collect();
    keyed.sort_by(|(ka, a), (kb, b)| order_keys(ka.as_ref(), kb.as_ref()).then_with(|| a.row_id.cmp(&b.row_id)));

    match &position.after {
        Some(after) => keyed.retain(|(key, _)| key.as_ref().and_then(|k| k.compare(after)) == Some(Ordering::Greater)),
        None if position.values_only => keyed.retain(|(key, _)| key.is_some()),
        None => {},
    }

    if limit > 0 && keyed.len() > limit {
        let boundary = keyed[limit - 1].0.clone();
        let end = keyed[limit..]
            .iter()
            .position(|(key, _)| !same_key(key.as_ref(), boundary.as_ref()))
            .map_or(keyed.len(), |n| limit + n);
        keyed.truncate(end);
    }

    keyed.into_iter().map(|(_, record)| record).collect()
}

/// Convert a JSON object into a record
///
/// `id_field` becomes the row id (and stays a field); `timestamp_field`
/// feeds the dedup recency tie-break.
pub(crate) fn record_from_json(
    object: serde_json::Map<String, serde_json::Value>,
    id_field: &str,
    timestamp_field: Option<&str>,
) -> Option<DataRecord> {
    let row_id = match object.get(id_field)? {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => return None,
        other => other.to_string(),
    };

    let mut record = DataRecord::new(row_id);
    for (name, value) in object {
        record.fields.insert(name, Value::from_json(value));
    }
    Some(attach_source_ts(record, timestamp_field))
}

pub(crate) fn attach_source_ts(record: DataRecord, timestamp_field: Option<&str>) -> DataRecord {
    let ts = timestamp_field.and_then(|field| match record.get(field) {
        Some(Value::DateTime(dt)) => Some(*dt),
        Some(Value::String(s)) => syncpipe_common::types::parse_datetime(s, None),
        _ => None,
    });
    match ts {
        Some(ts) => record.with_source_ts(ts),
        None => record,
    }
}
