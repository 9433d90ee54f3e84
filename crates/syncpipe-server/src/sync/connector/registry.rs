//! Source id -> connector lookup, built from `[[sources]]` configuration

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use syncpipe_common::FieldType;

use super::{Connector, CsvConnector, HttpConnector, JsonLinesConnector};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Jsonl,
    Csv,
    Http,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Jsonl => "jsonl",
            SourceKind::Csv => "csv",
            SourceKind::Http => "http",
        }
    }
}

/// One `[[sources]]` entry
///
/// ```toml
/// [[sources]]
/// id = "crm-contacts"
/// kind = "http"
/// url = "https://crm.internal/api/contacts"
/// auth_token_env = "CRM_TOKEN"
/// timestamp_field = "updated_at"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    /// File path for `jsonl` and `csv`
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Endpoint for `http`
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding a bearer token for `http`
    #[serde(default)]
    pub auth_token_env: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub timestamp_field: Option<String>,
    /// Single-character CSV delimiter
    #[serde(default)]
    pub delimiter: Option<char>,
    /// Declared CSV column types
    #[serde(default)]
    pub column_types: BTreeMap<String, FieldType>,
}

fn default_id_field() -> String {
    "id".to_string()
}

impl SourceConfig {
    fn require_path(&self) -> SyncResult<PathBuf> {
        self.path
            .clone()
            .ok_or_else(|| SyncError::config(format!("Source '{}' needs a path", self.id)))
    }

    /// Instantiate the connector described by this entry
    pub fn build(&self) -> SyncResult<Arc<dyn Connector>> {
        let connector: Arc<dyn Connector> = match self.kind {
            SourceKind::Jsonl => {
                let mut connector =
                    JsonLinesConnector::new(&self.id, self.require_path()?).with_id_field(&self.id_field);
                if let Some(field) = &self.timestamp_field {
                    connector = connector.with_timestamp_field(field);
                }
                Arc::new(connector)
            },
            SourceKind::Csv => {
                let mut connector =
                    CsvConnector::new(&self.id, self.require_path()?).with_id_field(&self.id_field);
                if let Some(field) = &self.timestamp_field {
                    connector = connector.with_timestamp_field(field);
                }
                if let Some(delimiter) = self.delimiter {
                    let byte = u8::try_from(delimiter).map_err(|_| {
                        SyncError::config(format!("Source '{}' delimiter must be ASCII", self.id))
                    })?;
                    connector = connector.with_delimiter(byte);
                }
                for (column, field_type) in &self.column_types {
                    connector = connector.with_column_type(column, *field_type);
                }
                Arc::new(connector)
            },
            SourceKind::Http => {
                let url = self
                    .url
                    .clone()
                    .ok_or_else(|| SyncError::config(format!("Source '{}' needs a url", self.id)))?;
                let timeout = Duration::from_secs(self.timeout_secs.unwrap_or(30));
                let mut connector =
                    HttpConnector::with_timeout(&self.id, url, timeout)?.with_id_field(&self.id_field);
                if let Some(field) = &self.timestamp_field {
                    connector = connector.with_timestamp_field(field);
                }
                if let Some(var) = &self.auth_token_env {
                    let token = std::env::var(var).map_err(|_| {
                        SyncError::config(format!("Source '{}' token variable {} is not set", self.id, var))
                    })?;
                    connector = connector.with_bearer_token(token);
                }
                Arc::new(connector)
            },
        };
        Ok(connector)
    }
}

/// Connectors keyed by source id
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sources(sources: &[SourceConfig]) -> SyncResult<Self> {
        let mut registry = Self::new();
        for source in sources {
            if registry.connectors.contains_key(&source.id) {
                return Err(SyncError::config(format!("Duplicate source id '{}'", source.id)));
            }
            registry.register(source.build()?);
        }
        Ok(registry)
    }

    /// Add or replace a connector under its own source id
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        tracing::debug!(source_id = connector.source_id(), "Registered connector");
        self.connectors.insert(connector.source_id().to_string(), connector);
    }

    pub fn get(&self, source_id: &str) -> SyncResult<Arc<dyn Connector>> {
        self.connectors
            .get(source_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("No connector for source '{}'", source_id)))
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.connectors.contains_key(source_id)
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connectors.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry").field("sources", &self.source_ids()).finish()
    }
}
