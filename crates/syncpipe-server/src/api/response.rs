//! API response types
//!
//! Every ops endpoint answers with the same envelope: `{"success": true, "data": ...}`
//! on success, `{"success": false, "error": {...}}` otherwise.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::SyncError;

/// Standard success response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            meta: None,
        }
    }

    pub fn success_with_meta(data: T, meta: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            meta: Some(meta),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Standard error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            success: false,
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Sync(SyncError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::new("NOT_FOUND", msg)),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new("BAD_REQUEST", msg))
            },
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse::new("CONFLICT", msg)),
            AppError::Sync(SyncError::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, ErrorResponse::new("NOT_FOUND", msg))
            },
            AppError::Sync(SyncError::Config(msg)) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new("BAD_REQUEST", msg))
            },
            AppError::Sync(SyncError::Database(err)) => {
                tracing::error!("Database error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("INTERNAL_ERROR", "A database error occurred"),
                )
            },
            AppError::Sync(err) => {
                tracing::error!(kind = %err.kind(), "Sync error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_details(
                        "SYNC_ERROR",
                        err.to_string(),
                        serde_json::json!({ "kind": err.kind() }),
                    ),
                )
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        AppError::Sync(err)
    }
}

/// Alias for Result with AppError
pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope() {
        let body = serde_json::to_value(ApiResponse::success(vec![1, 2])).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], serde_json::json!([1, 2]));
        assert!(body.get("meta").is_none());
    }

    #[test]
    fn test_sync_not_found_maps_to_404() {
        let response = AppError::from(SyncError::NotFound("job x".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_connection_error_maps_to_500() {
        let response = AppError::from(SyncError::connection("refused")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
