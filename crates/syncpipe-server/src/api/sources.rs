//! Source routes: checkpoints and export of committed batches

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

use super::response::{ApiResponse, ApiResult, AppError};
use super::AppState;
use crate::sync::checkpoint::Checkpoint;
use crate::sync::export::{export_batches, ExportFormat};

pub fn sources_routes() -> Router<AppState> {
    Router::new()
        .route("/:source_id/checkpoints", get(list_checkpoints))
        .route("/:source_id/export", get(export_source))
}

/// GET /api/v1/sources/:source_id/checkpoints
async fn list_checkpoints(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> ApiResult<ApiResponse<Vec<Checkpoint>>> {
    Ok(ApiResponse::success(state.orchestrator.checkpoints(&source_id).await?))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

/// GET /api/v1/sources/:source_id/export?format=jsonl|json|csv
async fn export_source(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let format = match query.format.as_deref() {
        Some(raw) => raw
            .parse::<ExportFormat>()
            .map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => ExportFormat::default(),
    };

    let batches = state.orchestrator.committed_batches(&source_id).await?;
    let body = export_batches(&batches, format)?;
    tracing::debug!(source = %source_id, batches = batches.len(), bytes = body.len(), "Export generated");

    let disposition = format!("attachment; filename=\"{}.{}\"", source_id, format.extension());
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}
