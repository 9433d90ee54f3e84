//! Export of committed batches as JSON, JSON Lines or CSV

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use syncpipe_common::DataBatch;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// One JSON array of batches
    Json,
    /// One record object per line, tagged with its batch
    #[default]
    Jsonl,
    Csv,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Jsonl => "application/x-ndjson",
            ExportFormat::Csv => "text/csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "jsonl" | "ndjson" => Ok(ExportFormat::Jsonl),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(SyncError::Validation(format!("Unsupported export format: {}", other))),
        }
    }
}

fn record_line(batch: &DataBatch, record: &syncpipe_common::DataRecord) -> serde_json::Value {
    let fields: serde_json::Map<String, serde_json::Value> =
        record.fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    serde_json::json!({
        "batch_id": batch.batch_id,
        "sequence": batch.sequence,
        "row_id": record.row_id,
        "fields": fields,
    })
}

pub fn export_batches(batches: &[DataBatch], format: ExportFormat) -> SyncResult<Vec<u8>> {
    match format {
        ExportFormat::Json => {
            serde_json::to_vec_pretty(batches).map_err(|e| SyncError::Validation(format!("JSON export failed: {}", e)))
        },
        ExportFormat::Jsonl => {
            let mut out = Vec::new();
            for batch in batches {
                for record in &batch.records {
                    serde_json::to_writer(&mut out, &record_line(batch, record))
                        .map_err(|e| SyncError::Validation(format!("JSONL export failed: {}", e)))?;
                    out.push(b'\n');
                }
            }
            Ok(out)
        },
        ExportFormat::Csv => export_csv(batches),
    }
}

/// Header is `batch_id, sequence, row_id` followed by the sorted union of field names
fn export_csv(batches: &[DataBatch]) -> SyncResult<Vec<u8>> {
    let columns: BTreeSet<&str> = batches
        .iter()
        .flat_map(|b| b.records.iter())
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .collect();

    let csv_err = |e: csv::Error| SyncError::Validation(format!("CSV export failed: {}", e));
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["batch_id", "sequence", "row_id"];
    header.extend(columns.iter().copied());
    writer.write_record(&header).map_err(csv_err)?;

    for batch in batches {
        let batch_id = batch.batch_id.to_string();
        let sequence = batch.sequence.to_string();
        for record in &batch.records {
            let mut row = vec![batch_id.clone(), sequence.clone(), record.row_id.clone()];
            row.extend(
                columns
                    .iter()
                    .map(|column| record.get(column).map(|v| v.to_text()).unwrap_or_default()),
            );
            writer.write_record(&row).map_err(csv_err)?;
        }
    }

    writer
        .into_inner()
        .map_err(|e| SyncError::Validation(format!("CSV export failed: {}", e)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use syncpipe_common::DataRecord;

    fn batches() -> Vec<DataBatch> {
        vec![DataBatch::new(
            "crm",
            0,
            Utc::now(),
            vec![
                DataRecord::new("1").with_field("name", "Ada").with_field("age", 36),
                DataRecord::new("2").with_field("name", "Grace, H."),
            ],
        )]
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("ndjson".parse::<ExportFormat>().unwrap(), ExportFormat::Jsonl);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_jsonl_one_line_per_record() {
        let out = String::from_utf8(export_batches(&batches(), ExportFormat::Jsonl).unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["row_id"], "1");
        assert_eq!(first["fields"]["age"], 36);
    }

    #[test]
    fn test_csv_header_and_quoting() {
        let out = String::from_utf8(export_batches(&batches(), ExportFormat::Csv).unwrap()).unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("batch_id,sequence,row_id,age,name"));
        assert!(lines.next().unwrap().ends_with(",0,1,36,Ada"));
        assert!(lines.next().unwrap().ends_with(",0,2,,\"Grace, H.\""));
    }

    #[test]
    fn test_json_round_trips_batches() {
        let input = batches();
        let out = export_batches(&input, ExportFormat::Json).unwrap();
        let parsed: Vec<DataBatch> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, input);
    }
}
