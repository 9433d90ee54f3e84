//! HTTP ops surface
//!
//! A thin axum layer over the [`Orchestrator`]. Authentication is left to the
//! gateway in front of the service.

pub mod jobs;
pub mod middleware;
pub mod response;
pub mod sources;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::config::CorsConfig;
use crate::sync::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn create_router(state: AppState, cors: &CorsConfig) -> Router {
    let api_v1 = Router::new()
        .nest("/jobs", jobs::jobs_routes())
        .nest("/sources", sources::sources_routes());

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_v1)
        .with_state(state)
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(cors))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let jobs = state.orchestrator.jobs().await;
    let failing = jobs.iter().filter(|j| j.is_terminal()).count();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "jobs": jobs.len(),
        "terminal_failures": failing,
    }))
}
