//! HTTP connector tests against a wiremock server

use chrono::{TimeZone, Utc};
use serde_json::json;
use syncpipe_common::Value;
use syncpipe_server::sync::connector::{Connector, HttpConnector, PullOutcome, PullRequest, ResumePosition};
use syncpipe_server::ErrorKind;
use wiremock::{
    matchers::{header, method, path, query_param, query_param_is_missing},
    Mock, MockServer, ResponseTemplate,
};

fn request(after: Option<Value>, limit: usize) -> PullRequest {
    PullRequest {
        position: match after {
            Some(value) => ResumePosition::after("seq", value),
            None => ResumePosition::full("seq"),
        },
        limit,
        sequence: 0,
        requested_at: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
    }
}

fn rows() -> serde_json::Value {
    json!([
        {"id": "c", "seq": 3, "name": "Linus"},
        {"id": "a", "seq": 1, "name": "Ada"},
        {"id": "b", "seq": 2, "name": "Grace"}
    ])
}

fn batch(outcome: PullOutcome) -> syncpipe_common::DataBatch {
    match outcome {
        PullOutcome::Batch(batch) => batch,
        PullOutcome::EndOfStream => panic!("expected a batch"),
    }
}

#[tokio::test]
async fn test_first_pull_sends_limit_without_since() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/contacts"))
        .and(query_param("limit", "2"))
        .and(query_param_is_missing("since"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let connector = HttpConnector::new("crm", format!("{}/contacts", mock_server.uri())).unwrap();
    let batch = batch(connector.pull(&request(None, 2)).await.unwrap());

    let ids: Vec<_> = batch.records.iter().map(|r| r.row_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(batch.source_id, "crm");
}

#[tokio::test]
async fn test_resume_sends_since_and_refilters_locally() {
    let mock_server = MockServer::start().await;

    // Server ignores `since` and returns everything
    Mock::given(method("GET"))
        .and(path("/contacts"))
        .and(query_param("since", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "records": rows() })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let connector = HttpConnector::new("crm", format!("{}/contacts", mock_server.uri())).unwrap();
    let batch = batch(connector.pull(&request(Some(Value::Int(2)), 10)).await.unwrap());

    assert_eq!(batch.len(), 1);
    assert_eq!(batch.records[0].row_id, "c");
    assert_eq!(batch.records[0].get("name"), Some(&Value::from("Linus")));
}

#[tokio::test]
async fn test_empty_response_is_end_of_stream() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/contacts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let connector = HttpConnector::new("crm", format!("{}/contacts", mock_server.uri())).unwrap();
    assert_eq!(connector.pull(&request(None, 10)).await.unwrap(), PullOutcome::EndOfStream);
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/contacts"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let connector = HttpConnector::new("crm", format!("{}/contacts", mock_server.uri()))
        .unwrap()
        .with_bearer_token("s3cret");
    assert!(connector.pull(&request(None, 10)).await.is_ok());
}

#[tokio::test]
async fn test_unauthorized_is_authentication_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let connector = HttpConnector::new("crm", format!("{}/contacts", mock_server.uri())).unwrap();
    let err = connector.pull(&request(None, 10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_server_error_is_connection_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let connector = HttpConnector::new("crm", format!("{}/contacts", mock_server.uri())).unwrap();
    let err = connector.pull(&request(None, 10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_source_is_connection_error() {
    let connector = HttpConnector::new("crm", "http://127.0.0.1:1/contacts").unwrap();
    let err = connector.pull(&request(None, 10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn test_malformed_body_is_connection_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rows": [] })))
        .mount(&mock_server)
        .await;

    let connector = HttpConnector::new("crm", format!("{}/contacts", mock_server.uri())).unwrap();
    let err = connector.pull(&request(None, 10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}
