//! File-backed connectors (JSON Lines and CSV)
//!
//! Both read the whole file on every pull and page through it in memory.
//! A missing or unreadable file is a connection error, so the scheduler
//! retries once the file shows up. Malformed rows are skipped with a warning.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use syncpipe_common::{DataRecord, FieldType, Value};
use tracing::warn;

use super::{attach_source_ts, record_from_json, select_after, Connector, PullOutcome, PullRequest};
use crate::error::{SyncError, SyncResult};

async fn read_source(path: &PathBuf) -> SyncResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SyncError::connection(format!("Failed to read {}: {}", path.display(), e)))
}

/// One JSON object per line
#[derive(Debug, Clone)]
pub struct JsonLinesConnector {
    source_id: String,
    path: PathBuf,
    id_field: String,
    timestamp_field: Option<String>,
}

impl JsonLinesConnector {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            id_field: "id".to_string(),
            timestamp_field: None,
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    fn parse(&self, content: &str) -> Vec<DataRecord> {
        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(serde_json::Value::Object(object)) => {
                    match record_from_json(object, &self.id_field, self.timestamp_field.as_deref()) {
                        Some(record) => records.push(record),
                        None => warn!(
                            source_id = %self.source_id,
                            line = line_no + 1,
                            id_field = %self.id_field,
                            "Skipping row without id"
                        ),
                    }
                },
                Ok(_) => warn!(source_id = %self.source_id, line = line_no + 1, "Skipping non-object row"),
                Err(e) => warn!(source_id = %self.source_id, line = line_no + 1, error = %e, "Skipping malformed row"),
            }
        }
        records
    }
}

#[async_trait]
impl Connector for JsonLinesConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullOutcome> {
        let content = read_source(&self.path).await?;
        let records = select_after(self.parse(&content), &request.position, request.limit);
        Ok(request.outcome(&self.source_id, records))
    }
}

/// Delimited text with a header row
///
/// Cells are strings unless `column_types` declares otherwise; declared
/// columns are coerced on read so checkpoint comparison is typed.
#[derive(Debug, Clone)]
pub struct CsvConnector {
    source_id: String,
    path: PathBuf,
    id_field: String,
    timestamp_field: Option<String>,
    delimiter: u8,
    column_types: BTreeMap<String, FieldType>,
}

impl CsvConnector {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            id_field: "id".to_string(),
            timestamp_field: None,
            delimiter: b',',
            column_types: BTreeMap::new(),
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_column_type(mut self, column: impl Into<String>, field_type: FieldType) -> Self {
        self.column_types.insert(column.into(), field_type);
        self
    }

    fn parse(&self, content: &str) -> SyncResult<Vec<DataRecord>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| SyncError::connection(format!("Invalid CSV header in {}: {}", self.path.display(), e)))?
            .clone();

        let mut records = Vec::new();
        for (row_no, row) in reader.records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(source_id = %self.source_id, row = row_no + 1, error = %e, "Skipping malformed row");
                    continue;
                },
            };

            match self.record_from_row(&headers, &row) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => warn!(source_id = %self.source_id, row = row_no + 1, "Skipping row without id"),
                Err(e) => warn!(source_id = %self.source_id, row = row_no + 1, error = %e, "Skipping row"),
            }
        }
        Ok(records)
    }

    fn record_from_row(&self, headers: &csv::StringRecord, row: &csv::StringRecord) -> SyncResult<Option<DataRecord>> {
        let mut fields = BTreeMap::new();
        for (name, cell) in headers.iter().zip(row.iter()) {
            let raw = if cell.is_empty() { Value::Null } else { Value::from(cell) };
            let value = match self.column_types.get(name) {
                Some(field_type) => raw.coerce(*field_type, None)?,
                None => raw,
            };
            fields.insert(name.to_string(), value);
        }

        let row_id = match fields.get(&self.id_field) {
            Some(value) if !value.is_null() => value.to_text(),
            _ => return Ok(None),
        };
        let record = DataRecord::new(row_id).with_fields(fields);
        Ok(Some(attach_source_ts(record, self.timestamp_field.as_deref())))
    }
}

#[async_trait]
impl Connector for CsvConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullOutcome> {
        let content = read_source(&self.path).await?;
        let records = select_after(self.parse(&content)?, &request.position, request.limit);
        Ok(request.outcome(&self.source_id, records))
    }
}
