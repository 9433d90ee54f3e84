//! HTTP polling connector
//!
//! Issues `GET {url}?limit=N[&since=V]` and expects either a JSON array of
//! objects or an object with a `records` array. The response is re-filtered
//! and re-ordered locally, so a server that ignores `since` still yields
//! correct incremental batches.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use super::{record_from_json, select_after, Connector, PullOutcome, PullRequest};
use crate::error::{SyncError, SyncResult};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct HttpConnector {
    source_id: String,
    url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
    id_field: String,
    timestamp_field: Option<String>,
}

impl HttpConnector {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> SyncResult<Self> {
        Self::with_timeout(source_id, url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        source_id: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("syncpipe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            source_id: source_id.into(),
            url: url.into(),
            client,
            bearer_token: None,
            id_field: "id".to_string(),
            timestamp_field: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    fn classify_status(&self, status: StatusCode) -> SyncResult<()> {
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::authentication(format!(
                "{} rejected credentials ({})",
                self.source_id, status
            ))),
            s => Err(SyncError::connection(format!("{} returned {}", self.source_id, s))),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    #[tracing::instrument(skip(self, request), fields(source_id = %self.source_id, sequence = request.sequence))]
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullOutcome> {
        let mut query = vec![("limit".to_string(), request.limit.to_string())];
        if let Some(after) = &request.position.after {
            query.push(("since".to_string(), after.to_text()));
        }

        let mut builder = self.client.get(&self.url).query(&query);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SyncError::connection(format!("Request to {} failed: {}", self.url, e)))?;
        self.classify_status(response.status())?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::connection(format!("Invalid JSON from {}: {}", self.url, e)))?;

        let rows = match body {
            serde_json::Value::Array(rows) => rows,
            serde_json::Value::Object(mut object) => match object.remove("records") {
                Some(serde_json::Value::Array(rows)) => rows,
                _ => {
                    return Err(SyncError::connection(format!(
                        "Response from {} has no records array",
                        self.url
                    )))
                },
            },
            _ => return Err(SyncError::connection(format!("Unexpected response shape from {}", self.url))),
        };

        let records = rows
            .into_iter()
            .filter_map(|row| match row {
                serde_json::Value::Object(object) => {
                    record_from_json(object, &self.id_field, self.timestamp_field.as_deref())
                },
                _ => None,
            })
            .collect();

        let records = select_after(records, &request.position, request.limit);
        tracing::debug!(records = records.len(), "Pulled from HTTP source");
        Ok(request.outcome(&self.source_id, records))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let connector = HttpConnector::new("api", "http://localhost:1/rows").unwrap();
        assert!(connector.classify_status(StatusCode::OK).is_ok());
        assert!(!connector.classify_status(StatusCode::UNAUTHORIZED).unwrap_err().is_retryable());
        assert!(!connector.classify_status(StatusCode::FORBIDDEN).unwrap_err().is_retryable());
        assert!(connector.classify_status(StatusCode::BAD_GATEWAY).unwrap_err().is_retryable());
    }
}
