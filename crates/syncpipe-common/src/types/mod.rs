//! Record and batch types shared by every pipeline stage
//!
//! A [`DataBatch`] is the unit of transformation, cleansing and commit. Its
//! records do not carry their own batch or source id: they inherit the
//! batch's metadata, so every record of a batch shares both by construction.

mod value;

pub use value::{parse_datetime, FieldType, Value};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single record pulled from a source
///
/// Records are treated as immutable once produced by a connector; stages
/// build new records through the `with_*` methods instead of mutating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Opaque source-native row identifier
    pub row_id: String,
    /// Field name -> value, ordered by field name
    pub fields: BTreeMap<String, Value>,
    /// Source-side modification time, used as the dedup recency tie-break
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ts: Option<DateTime<Utc>>,
}

impl DataRecord {
    pub fn new(row_id: impl Into<String>) -> Self {
        Self {
            row_id: row_id.into(),
            fields: BTreeMap::new(),
            source_ts: None,
        }
    }

    /// Builder-style field insertion
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_source_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.source_ts = Some(ts);
        self
    }

    /// New record with the same identity and a replaced field map
    pub fn with_fields(&self, fields: BTreeMap<String, Value>) -> Self {
        Self {
            row_id: self.row_id.clone(),
            fields,
            source_ts: self.source_ts,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Field value, treating a missing field as null
    pub fn value_or_null(&self, field: &str) -> Value {
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    /// Non-null value of `field` coerced to `field_type`
    ///
    /// `None` when the field is missing, null, or does not coerce. Without a
    /// type the raw value is returned.
    pub fn typed_value(&self, field: &str, field_type: Option<FieldType>) -> Option<Value> {
        let raw = self.get(field).filter(|v| !v.is_null())?;
        match field_type {
            Some(target) => raw.coerce(target, None).ok().filter(|v| !v.is_null()),
            None => Some(raw.clone()),
        }
    }
}

/// An ordered group of records produced by one connector pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBatch {
    pub batch_id: Uuid,
    /// Position of this batch within its sync run
    pub sequence: u32,
    pub source_id: String,
    pub produced_at: DateTime<Utc>,
    pub records: Vec<DataRecord>,
}

impl DataBatch {
    pub fn new(
        source_id: impl Into<String>,
        sequence: u32,
        produced_at: DateTime<Utc>,
        records: Vec<DataRecord>,
    ) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            sequence,
            source_id: source_id.into(),
            produced_at,
            records,
        }
    }

    /// Same batch metadata with a different record set
    pub fn with_records(&self, records: Vec<DataRecord>) -> Self {
        Self {
            batch_id: self.batch_id,
            sequence: self.sequence,
            source_id: self.source_id.clone(),
            produced_at: self.produced_at,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Largest value of `field` across the batch
    ///
    /// Nulls and values that do not compare with the running maximum are skipped.
    pub fn max_value(&self, field: &str) -> Option<&Value> {
        self.records
            .iter()
            .filter_map(|r| r.get(field))
            .filter(|v| !v.is_null())
            .fold(None, |max: Option<&Value>, v| match max {
                Some(current) if v.compare(current) != Some(std::cmp::Ordering::Greater) => Some(current),
                _ => Some(v),
            })
    }

    /// Largest value of `field` after coercion to `field_type`
    ///
    /// Compares typed values, so string timestamps with different UTC offsets
    /// order by instant rather than by text. Records whose value is missing
    /// or does not coerce are skipped.
    pub fn max_value_as(&self, field: &str, field_type: FieldType) -> Option<Value> {
        self.records
            .iter()
            .filter_map(|r| r.typed_value(field, Some(field_type)))
            .fold(None, |max: Option<Value>, v| match max {
                Some(current) if v.compare(&current) != Some(std::cmp::Ordering::Greater) => Some(current),
                _ => Some(v),
            })
    }

    /// Serialized size of the records, used for bytes-processed accounting
    pub fn approx_bytes(&self) -> usize {
        serde_json::to_vec(&self.records).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn record(id: &str, n: i64) -> DataRecord {
        DataRecord::new(id).with_field("n", n)
    }

    #[test]
    fn test_with_records_keeps_metadata() {
        let batch = DataBatch::new("src", 3, Utc::now(), vec![record("a", 1)]);
        let next = batch.with_records(vec![record("b", 2), record("c", 3)]);

        assert_eq!(next.batch_id, batch.batch_id);
        assert_eq!(next.sequence, 3);
        assert_eq!(next.source_id, "src");
        assert_eq!(next.len(), 2);
    }

    #[test]
    fn test_max_value_skips_nulls() {
        let batch = DataBatch::new(
            "src",
            0,
            Utc::now(),
            vec![
                record("a", 5),
                DataRecord::new("b").with_field("n", Value::Null),
                record("c", 9),
                record("d", 2),
            ],
        );
        assert_eq!(batch.max_value("n"), Some(&Value::Int(9)));
        assert_eq!(batch.max_value("missing"), None);
    }

    #[test]
    fn test_max_value_as_orders_timestamps_by_instant() {
        let batch = DataBatch::new(
            "src",
            0,
            Utc::now(),
            vec![
                DataRecord::new("a").with_field("ts", "2026-03-01T10:00:00+05:00"),
                DataRecord::new("b").with_field("ts", "2026-03-01T06:00:00Z"),
                DataRecord::new("c").with_field("ts", "not a date"),
            ],
        );

        // Lexicographic order would pick "a"
        assert_eq!(batch.max_value("ts"), Some(&Value::from("2026-03-01T10:00:00+05:00")));
        assert_eq!(
            batch.max_value_as("ts", FieldType::Datetime),
            parse_datetime("2026-03-01T06:00:00Z", None).map(Value::DateTime)
        );
        assert_eq!(batch.max_value_as("missing", FieldType::Datetime), None);
    }

    #[test]
    fn test_typed_value() {
        let r = DataRecord::new("a").with_field("n", "42").with_field("z", Value::Null);
        assert_eq!(r.typed_value("n", Some(FieldType::Int)), Some(Value::Int(42)));
        assert_eq!(r.typed_value("n", None), Some(Value::from("42")));
        assert_eq!(r.typed_value("n", Some(FieldType::Bool)), None);
        assert_eq!(r.typed_value("z", Some(FieldType::Int)), None);
    }

    #[test]
    fn test_record_value_or_null() {
        let r = record("a", 1);
        assert_eq!(r.value_or_null("n"), Value::Int(1));
        assert_eq!(r.value_or_null("x"), Value::Null);
    }
}
