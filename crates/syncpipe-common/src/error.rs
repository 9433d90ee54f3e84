//! Error types shared across syncpipe crates

use thiserror::Error;

use crate::types::FieldType;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared data model and utilities
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cannot convert {value} to {target}")]
    Coercion { value: String, target: FieldType },

    #[error("Values are not comparable: {left} vs {right}")]
    Incomparable { left: String, right: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CommonError {
    pub fn coercion(value: impl ToString, target: FieldType) -> Self {
        Self::Coercion {
            value: value.to_string(),
            target,
        }
    }
}
