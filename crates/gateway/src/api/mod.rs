//! HTTP API surface.
//!
//! Engine operations plus read-only run and job inspection; no
//! authentication (the service binds localhost by default).

pub mod jobs;
pub mod runs;

use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/jobs", get(jobs::list_jobs))
        .route("/api/v1/jobs/:id", get(jobs::get_job))
        .route("/api/v1/runs", get(runs::list_runs).post(runs::schedule_run))
        .route("/api/v1/runs/events", get(runs::run_events_sse))
        .route("/api/v1/runs/:id", get(runs::get_run))
        .route("/api/v1/runs/:id/output", get(runs::get_run_output))
        .route("/api/v1/runs/:id/cancel", post(runs::cancel_run))
        .route("/api/v1/runs/:id/start", post(runs::start_run))
        .route("/api/v1/runs/:id/rerun", post(runs::rerun_run))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
