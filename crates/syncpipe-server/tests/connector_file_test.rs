//! File connectors driven through the orchestrator, with rows appended between runs

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use syncpipe_common::types::parse_datetime;
use syncpipe_common::{FieldType, Value};
use tempfile::TempDir;

use syncpipe_server::sync::connector::{
    Connector, CsvConnector, JsonLinesConnector, PullOutcome, PullRequest, ResumePosition,
};
use syncpipe_server::sync::{JobsFile, Orchestrator, RunOutcome, SyncExecution};
use syncpipe_server::config::SyncSettings;
use syncpipe_server::ErrorKind;

fn append(path: &Path, lines: &[&str]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
}

fn executed(outcome: RunOutcome) -> SyncExecution {
    match outcome {
        RunOutcome::Executed(execution) => execution,
        other => panic!("expected an executed run, got {:?}", other),
    }
}

fn full_pull(field: &str, limit: usize) -> PullRequest {
    PullRequest {
        position: ResumePosition::full(field),
        limit,
        sequence: 0,
        requested_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_jsonl_skips_malformed_lines() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("contacts.jsonl");
    append(
        &path,
        &[
            r#"{"id": "1", "updated_at": "2026-03-01T10:00:00Z"}"#,
            "not json",
            r#"{"updated_at": "2026-03-01T11:00:00Z"}"#,
            "",
            r#"{"id": "2", "updated_at": "2026-03-01T12:00:00Z"}"#,
        ],
    );

    let connector = JsonLinesConnector::new("crm", &path).with_timestamp_field("updated_at");
    let PullOutcome::Batch(batch) = connector.pull(&full_pull("updated_at", 10)).await.unwrap() else {
        panic!("expected a batch");
    };
    assert_eq!(batch.len(), 2);
    assert!(batch.records[0].source_ts.is_some());
}

#[tokio::test]
async fn test_missing_file_is_connection_error() {
    let dir = TempDir::new().unwrap();
    let connector = JsonLinesConnector::new("crm", dir.path().join("absent.jsonl"));
    let err = connector.pull(&full_pull("updated_at", 10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn test_csv_declared_columns_are_typed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("invoices.csv");
    append(
        &path,
        &[
            "invoice_id;amount;issued_at",
            "10;19.90;2026-03-01T09:00:00Z",
            "11;5;2026-03-01T09:30:00Z",
        ],
    );

    let connector = CsvConnector::new("billing", &path)
        .with_id_field("invoice_id")
        .with_delimiter(b';')
        .with_column_type("amount", FieldType::Float)
        .with_column_type("issued_at", FieldType::Datetime);

    let PullOutcome::Batch(batch) = connector.pull(&full_pull("issued_at", 10)).await.unwrap() else {
        panic!("expected a batch");
    };
    assert_eq!(batch.records[0].row_id, "10");
    assert_eq!(batch.records[1].get("amount"), Some(&Value::Float(5.0)));
    assert!(matches!(batch.records[0].get("issued_at"), Some(Value::DateTime(_))));
}

#[tokio::test]
async fn test_jobs_file_runs_pick_up_appended_rows() {
    let dir = TempDir::new().unwrap();
    let contacts = dir.path().join("contacts.jsonl");
    let invoices = dir.path().join("invoices.csv");
    append(
        &contacts,
        &[
            r#"{"id": "1", "email": "Ada@Example.com ", "updated_at": "2026-03-01T10:00:00Z"}"#,
            r#"{"id": "2", "email": "grace@example.com", "updated_at": "2026-03-01T11:00:00Z"}"#,
            r#"{"id": "3", "email": "ada@example.com", "updated_at": "2026-03-01T12:00:00Z"}"#,
        ],
    );
    append(&invoices, &["invoice_id,amount,issued_at", "10,19.999,2026-03-01T09:00:00Z"]);

    let toml = format!(
        r#"
        [[sources]]
        id = "crm"
        kind = "jsonl"
        path = '{contacts}'

        [[sources]]
        id = "billing"
        kind = "csv"
        path = '{invoices}'
        id_field = "invoice_id"

        [sources.column_types]
        amount = "float"
        issued_at = "datetime"

        [[jobs]]
        name = "contacts"
        source = "crm"
        cron = "*/5 * * * *"

        [jobs.pull]
        checkpoint_field = "updated_at"
        checkpoint_type = "datetime"
        batch_size = 2

        [[jobs.transform.normalization]]
        fields = ["email"]
        ops = ["trim", "lowercase"]

        [jobs.cleansing.dedup]
        key_fields = ["email"]
        recent_window_secs = 3600

        [[jobs]]
        name = "invoices"
        source = "billing"
        cron = "0 * * * *"

        [jobs.pull]
        checkpoint_field = "issued_at"
        checkpoint_type = "datetime"

        [[jobs.transform.value_transforms]]
        field = "amount"
        op = "round"
        decimals = 2
        "#,
        contacts = contacts.display(),
        invoices = invoices.display(),
    );

    let file = JobsFile::parse(&toml).unwrap();
    let orchestrator = Arc::new(Orchestrator::builder(file.registry().unwrap()).build());
    let mut ids = Vec::new();
    for job in file.to_jobs(&SyncSettings::default()) {
        ids.push(orchestrator.register(job).await.unwrap().id);
    }
    let (contacts_job, invoices_job) = (ids[0], ids[1]);

    // Ada appears twice after normalization; the second copy is in a later batch
    let first = executed(orchestrator.run_now(contacts_job).await.unwrap());
    assert_eq!(first.rows_synced, 2);
    assert_eq!(first.rows_rejected, 1);
    let t3 = parse_datetime("2026-03-01T12:00:00Z", None).unwrap();
    assert_eq!(first.checkpoint_value, Some(Value::DateTime(t3)));

    append(
        &contacts,
        &[r#"{"id": "4", "email": "linus@example.com", "updated_at": "2026-03-01T13:00:00Z"}"#],
    );
    let second = executed(orchestrator.run_now(contacts_job).await.unwrap());
    assert_eq!(second.rows_synced, 1);

    let invoice_run = executed(orchestrator.run_now(invoices_job).await.unwrap());
    assert_eq!(invoice_run.rows_synced, 1);
    let batches = orchestrator.committed_batches("billing").await.unwrap();
    assert_eq!(batches[0].records[0].get("amount"), Some(&Value::Float(20.0)));

    append(&invoices, &["11,7.5,2026-03-01T10:00:00Z"]);
    let invoice_run = executed(orchestrator.run_now(invoices_job).await.unwrap());
    assert_eq!(invoice_run.rows_synced, 1);
    assert_eq!(orchestrator.committed_batches("billing").await.unwrap().len(), 2);
}
