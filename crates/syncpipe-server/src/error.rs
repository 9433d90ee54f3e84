//! Pipeline error taxonomy
//!
//! Every sync component returns [`SyncError`]. The HTTP layer converts it
//! through `api::response::AppError`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use syncpipe_common::CommonError;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Pipeline error taxonomy
#[derive(Error, Debug)]
pub enum SyncError {
    /// Source unreachable or transport failure; retried with backoff
    #[error("Connection error: {0}")]
    Connection(String),

    /// Credentials rejected by the source; fatal to the run, never retried
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transform error in {stage} stage: {message}")]
    Transform { stage: String, message: String },

    #[error("Idempotency key '{key}' already used with a different payload (stored {stored_hash}, got {submitted_hash})")]
    DuplicateKeyConflict {
        key: String,
        stored_hash: String,
        submitted_hash: String,
    },

    /// Cache backend failed; callers proceed without caching
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Job timed out after {0:?}")]
    JobTimeout(Duration),

    #[error("Checkpoint for {source_id}.{field} cannot move backwards from {current} to {proposed}")]
    CheckpointRegression {
        source_id: String,
        field: String,
        current: String,
        proposed: String,
    },

    #[error("Run cancelled: job {0} was disabled")]
    Cancelled(Uuid),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Stable error classification, used for run-summary counters and history rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Authentication,
    Validation,
    Transform,
    DuplicateKeyConflict,
    CacheUnavailable,
    JobTimeout,
    CheckpointRegression,
    Cancelled,
    Sink,
    Storage,
    Config,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Validation => "validation",
            ErrorKind::Transform => "transform",
            ErrorKind::DuplicateKeyConflict => "duplicate_key_conflict",
            ErrorKind::CacheUnavailable => "cache_unavailable",
            ErrorKind::JobTimeout => "job_timeout",
            ErrorKind::CheckpointRegression => "checkpoint_regression",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Sink => "sink",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
            ErrorKind::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn transform(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transform {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Connection(_) => ErrorKind::Connection,
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Transform { .. } => ErrorKind::Transform,
            SyncError::DuplicateKeyConflict { .. } => ErrorKind::DuplicateKeyConflict,
            SyncError::CacheUnavailable(_) => ErrorKind::CacheUnavailable,
            SyncError::JobTimeout(_) => ErrorKind::JobTimeout,
            SyncError::CheckpointRegression { .. } => ErrorKind::CheckpointRegression,
            SyncError::Cancelled(_) => ErrorKind::Cancelled,
            SyncError::Sink(_) => ErrorKind::Sink,
            SyncError::Database(_) => ErrorKind::Storage,
            SyncError::Common(_) => ErrorKind::Transform,
            SyncError::Config(_) => ErrorKind::Config,
            SyncError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Whether a job that failed with this error may be retried by the scheduler
    ///
    /// Authentication failures, idempotency conflicts and configuration
    /// errors will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::Authentication(_)
                | SyncError::DuplicateKeyConflict { .. }
                | SyncError::Config(_)
                | SyncError::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::connection("reset by peer").is_retryable());
        assert!(SyncError::JobTimeout(Duration::from_secs(5)).is_retryable());
        assert!(!SyncError::authentication("bad token").is_retryable());
        assert!(!SyncError::DuplicateKeyConflict {
            key: "k".into(),
            stored_hash: "a".into(),
            submitted_hash: "b".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_error_kind_strings() {
        assert_eq!(SyncError::connection("x").kind().as_str(), "connection");
        assert_eq!(SyncError::transform("mapping", "x").kind(), ErrorKind::Transform);
        assert_eq!(ErrorKind::DuplicateKeyConflict.to_string(), "duplicate_key_conflict");
    }
}
