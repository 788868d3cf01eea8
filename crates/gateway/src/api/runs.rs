//! Run API endpoints.
//!
//! - `GET  /api/v1/runs`             — list runs with filters
//! - `POST /api/v1/runs`             — schedule a new run
//! - `GET  /api/v1/runs/:id`         — get a single run
//! - `GET  /api/v1/runs/:id/output`  — fetch the captured output blob
//! - `POST /api/v1/runs/:id/cancel`  — cancel a scheduled run
//! - `POST /api/v1/runs/:id/start`   — start a scheduled run now
//! - `POST /api/v1/runs/:id/rerun`   — create a rerun
//! - `GET  /api/v1/runs/events`      — SSE stream of run transitions

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::Deserialize;

use cadence_engine::{EngineError, Instance, RunState, StoreError};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/v1/runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub job: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<ListRunsQuery>,
) -> impl IntoResponse {
    let run_state = q.state.as_deref().and_then(parse_state);
    let limit = q.limit.min(200);

    let (runs, total) = state
        .engine
        .list(run_state, q.job.as_deref(), limit, q.offset);

    Json(serde_json::json!({
        "runs": runs,
        "total": total,
        "limit": limit,
        "offset": q.offset,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/v1/runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ScheduleRunBody {
    pub job_id: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Wall-clock start time; omit to run immediately.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

pub async fn schedule_run(
    State(state): State<AppState>,
    Json(body): Json<ScheduleRunBody>,
) -> Response {
    if state.engine.catalog().get(&body.job_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown job: {}", body.job_id) })),
        )
            .into_response();
    }

    let run = state
        .engine
        .new_run(Instance::new(body.job_id, body.args), false);
    match state.engine.schedule(body.time, run).await {
        Ok(run) => (StatusCode::CREATED, Json(serde_json::json!(run))).into_response(),
        Err(e) => engine_error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/v1/runs/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.engine.get_run(&run_id) {
        Some(run) => {
            let mut body = serde_json::json!(run);
            body["outputs"] = serde_json::json!(state.engine.output_ids(&run_id));
            Json(body).into_response()
        }
        None => not_found("run not found"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/v1/runs/:id/output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_run_output(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    match state.engine.output(&run_id, cadence_engine::program::OUTPUT_ID) {
        Ok(blob) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            blob,
        )
            .into_response(),
        Err(StoreError::OutputNotFound { .. }) => not_found("output not found"),
        Err(e) => internal_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/v1/runs/:id/{cancel,start,rerun}
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.engine.cancel(&run_id).await {
        Ok(run) => Json(serde_json::json!(run)).into_response(),
        Err(e) => engine_error_response(e),
    }
}

pub async fn start_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.engine.start(&run_id).await {
        Ok(run) => Json(serde_json::json!(run)).into_response(),
        Err(e) => engine_error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RerunBody {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

pub async fn rerun_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Option<Json<RerunBody>>,
) -> Response {
    let time = body.and_then(|Json(b)| b.time);
    match state.engine.rerun(&run_id, time).await {
        Ok(run) => (StatusCode::CREATED, Json(serde_json::json!(run))).into_response(),
        Err(e) => engine_error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/v1/runs/events (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_events_sse(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.engine.subscribe();
    Sse::new(make_event_stream(rx)).keep_alive(KeepAlive::default())
}

fn make_event_stream(
    mut rx: tokio::sync::broadcast::Receiver<cadence_engine::RunEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event("run.transition").data(data));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    let msg = format!("{{\"warning\":\"missed {n} events\"}}");
                    yield Ok(Event::default().event("warning").data(msg));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_state(s: &str) -> Option<RunState> {
    match s {
        "new" => Some(RunState::New),
        "scheduled" => Some(RunState::Scheduled),
        "running" => Some(RunState::Running),
        "success" => Some(RunState::Success),
        "failure" => Some(RunState::Failure),
        "error" => Some(RunState::Error),
        _ => None,
    }
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn engine_error_response(e: EngineError) -> Response {
    let status = match &e {
        EngineError::UnknownRun(_) | EngineError::UnknownJob(_) => StatusCode::NOT_FOUND,
        EngineError::DuplicateRun(_)
        | EngineError::AlreadyTerminal(_)
        | EngineError::AlreadyStarted(_)
        | EngineError::IllegalTransition { .. } => StatusCode::CONFLICT,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
