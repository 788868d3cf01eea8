//! Job inspection API endpoints.
//!
//! - `GET /api/v1/jobs`     — list job definitions
//! - `GET /api/v1/jobs/:id` — get a single job definition

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::state::AppState;

pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let jobs: Vec<_> = state.engine.catalog().iter().collect();
    Json(serde_json::json!({
        "jobs": jobs,
        "total": jobs.len(),
    }))
}

pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.engine.catalog().get(&job_id) {
        Some(job) => Json(serde_json::json!(job)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "job not found" })),
        )
            .into_response(),
    }
}
