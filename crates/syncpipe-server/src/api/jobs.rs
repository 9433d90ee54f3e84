//! Job routes
//!
//! Read job state and history, trigger a run, enable or disable a job.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::response::{ApiResponse, ApiResult};
use super::AppState;
use crate::sync::{RunOutcome, SyncExecution, SyncJob};

const DEFAULT_EXECUTION_LIMIT: usize = 20;
const MAX_EXECUTION_LIMIT: usize = 500;

pub fn jobs_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/:job_id", get(get_job))
        .route("/:job_id/executions", get(list_executions))
        .route("/:job_id/trigger", post(trigger_job))
        .route("/:job_id/enable", post(enable_job))
        .route("/:job_id/disable", post(disable_job))
}

/// GET /api/v1/jobs
async fn list_jobs(State(state): State<AppState>) -> ApiResult<ApiResponse<Vec<SyncJob>>> {
    let jobs = state.orchestrator.jobs().await;
    let total = jobs.len();
    Ok(ApiResponse::success_with_meta(jobs, serde_json::json!({ "total": total })))
}

/// GET /api/v1/jobs/:job_id
async fn get_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> ApiResult<ApiResponse<SyncJob>> {
    Ok(ApiResponse::success(state.orchestrator.job(job_id).await?))
}

#[derive(Debug, Deserialize)]
struct ExecutionsQuery {
    limit: Option<usize>,
}

/// GET /api/v1/jobs/:job_id/executions?limit=20
async fn list_executions(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<ExecutionsQuery>,
) -> ApiResult<ApiResponse<Vec<SyncExecution>>> {
    let limit = query.limit.unwrap_or(DEFAULT_EXECUTION_LIMIT).clamp(1, MAX_EXECUTION_LIMIT);
    Ok(ApiResponse::success(state.orchestrator.executions(job_id, limit).await?))
}

/// POST /api/v1/jobs/:job_id/trigger
///
/// Runs the job to completion and returns the execution, or the reason it was skipped.
async fn trigger_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> ApiResult<ApiResponse<RunOutcome>> {
    tracing::info!(job_id = %job_id, "Manual trigger");
    Ok(ApiResponse::success(state.orchestrator.run_now(job_id).await?))
}

/// POST /api/v1/jobs/:job_id/enable
async fn enable_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> ApiResult<ApiResponse<SyncJob>> {
    Ok(ApiResponse::success(state.orchestrator.enable(job_id).await?))
}

/// POST /api/v1/jobs/:job_id/disable
async fn disable_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> ApiResult<ApiResponse<SyncJob>> {
    Ok(ApiResponse::success(state.orchestrator.disable(job_id).await?))
}
