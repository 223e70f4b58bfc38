//! Run API endpoints
//!
//! Runs are created queued and executed in the background; callers follow
//! them through the live SSE stream or by polling the run detail. The
//! durable audit log is served separately from the live stream.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use agent_runner::ResumeOutcome;
use cua_core::event::{RunEvent, STREAM_END};
use cua_core::run::{Run, RunResult, RunStatus, RunSummary, WorkItem};

use crate::state::AppState;

use super::{bad_request, conflict, internal_error, not_found, runner_error, RouteError, TENANT_HEADER};

// ============================================================================
// Request/Response types
// ============================================================================

/// Per-run overrides of the server's default run config
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfigOverrides {
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub post_action_delay_ms: Option<u64>,
    #[serde(default)]
    pub click_settle_delay_ms: Option<u64>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub enable_reflection: Option<bool>,
    #[serde(default)]
    pub enable_code_execution: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub task: String,
    /// Ordered work items; the task text alone when empty
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub config: RunConfigOverrides,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsResponse {
    pub items: Vec<RunSummary>,
    pub has_more: bool,
    pub next_offset: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetailResponse {
    pub run: Run,
    pub result: Option<RunResult>,
    /// Whether a handback snapshot is stored, i.e. the run can be resumed
    pub resumable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEventsQuery {
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEventsResponse {
    pub events: Vec<RunEvent>,
    pub has_more: bool,
    pub next_offset: Option<usize>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/runs - Queue a run
async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), RouteError> {
    let task = req.task.trim();
    if task.is_empty() {
        return Err(bad_request("Task must not be empty"));
    }
    if req.subtasks.iter().any(|subtask| subtask.trim().is_empty()) {
        return Err(bad_request("Subtasks must not be empty"));
    }

    let mut config = state.config().run_config(task);
    let overrides = req.config;
    if let Some(max_steps) = overrides.max_steps {
        if max_steps == 0 {
            return Err(bad_request("maxSteps must be at least 1"));
        }
        config.max_steps = max_steps;
    }
    if let Some(delay) = overrides.post_action_delay_ms {
        config.post_action_delay_ms = delay;
    }
    if let Some(delay) = overrides.click_settle_delay_ms {
        config.click_settle_delay_ms = delay;
    }
    if let Some(platform) = overrides.platform {
        config.platform = platform;
    }
    if let Some(enabled) = overrides.enable_reflection {
        config.enable_reflection = enabled;
    }
    if let Some(enabled) = overrides.enable_code_execution {
        config.enable_code_execution = enabled;
    }

    let tenant_id = tenant_from_headers(&headers);
    let run = if req.subtasks.is_empty() {
        Run::new(config, tenant_id)
    } else {
        let plan = req
            .subtasks
            .iter()
            .map(|subtask| WorkItem::new(subtask.trim()))
            .collect();
        Run::with_plan(config, tenant_id, plan)
    };

    let run_id = state.controller().submit(run).map_err(internal_error)?;
    info!("Run {} queued", run_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateRunResponse {
            run_id,
            status: RunStatus::Queued,
            message: "Run queued".to_string(),
        }),
    ))
}

/// GET /api/v1/runs - List runs, newest first
async fn list_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ListRunsResponse>, RouteError> {
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            RunStatus::parse(raw).ok_or_else(|| bad_request(format!("Unknown status: {}", raw)))?,
        ),
        None => None,
    };
    let tenant_id = tenant_from_headers(&headers);

    let (runs, has_more) = state
        .run_store()
        .list_runs(offset, limit, status, tenant_id.as_deref())
        .map_err(internal_error)?;

    let items = runs.iter().map(RunSummary::from).collect::<Vec<_>>();
    let next_offset = if has_more {
        Some(offset + items.len())
    } else {
        None
    };

    Ok(Json(ListRunsResponse {
        items,
        has_more,
        next_offset,
    }))
}

/// GET /api/v1/runs/{id} - Run record, plan history and latest result
async fn get_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDetailResponse>, RouteError> {
    let run = load_visible_run(&state, &headers, run_id)?;
    let result = state.run_store().load_result(run_id).map_err(internal_error)?;
    let resumable = run.status == RunStatus::Attention && state.run_store().has_snapshot(run_id);

    Ok(Json(RunDetailResponse {
        run,
        result,
        resumable,
    }))
}

/// DELETE /api/v1/runs/{id} - Remove a finished run and its stored data
async fn delete_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> Result<StatusCode, RouteError> {
    let run = load_visible_run(&state, &headers, run_id)?;
    if !run.is_terminal() {
        return Err(conflict(
            format!("Run {} is {}; only finished runs can be deleted", run_id, run.status.as_str()),
            "run_not_finished",
        ));
    }

    state.run_store().delete_run(run_id).map_err(internal_error)?;
    state.controller().hub().close(run_id);
    info!("Deleted run {}", run_id);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/runs/{id}/stream - Live events as server-sent events
async fn stream_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RouteError> {
    let run = load_visible_run(&state, &headers, run_id)?;

    let rx = if is_active(run.status) {
        let hub = state.controller().hub();
        let rx = hub.subscribe(run_id);
        // The run may have finished between the load and the subscribe
        let still_active = state
            .run_store()
            .find_run(run_id)
            .map_err(internal_error)?
            .is_some_and(|run| is_active(run.status));
        if still_active {
            Some(rx)
        } else {
            hub.close(run_id);
            None
        }
    } else {
        None
    };

    Ok(Sse::new(live_events(run_id, rx)))
}

/// GET /api/v1/runs/{id}/events - Durable audit events
async fn list_run_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
    Query(query): Query<RunEventsQuery>,
) -> Result<Json<RunEventsResponse>, RouteError> {
    load_visible_run(&state, &headers, run_id)?;
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(200).min(1000);

    let (events, has_more) = state
        .run_store()
        .load_events_paginated(run_id, offset, limit)
        .map_err(internal_error)?;

    let next_offset = if has_more {
        Some(offset + events.len())
    } else {
        None
    };

    Ok(Json(RunEventsResponse {
        events,
        has_more,
        next_offset,
    }))
}

/// POST /api/v1/runs/{id}/resume - Resume a run after human handback
async fn resume_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ResumeOutcome>, RouteError> {
    let tenant_id = tenant_from_headers(&headers);
    let outcome = state
        .controller()
        .resume(run_id, tenant_id.as_deref())
        .await
        .map_err(|e| {
            warn!("Resume of run {} failed: {}", run_id, e);
            runner_error(e)
        })?;

    Ok(Json(outcome))
}

// ============================================================================
// Router
// ============================================================================

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/runs", get(list_runs).post(create_run))
        .route("/api/v1/runs/{id}", get(get_run).delete(delete_run))
        .route("/api/v1/runs/{id}/stream", get(stream_run))
        .route("/api/v1/runs/{id}/events", get(list_run_events))
        .route("/api/v1/runs/{id}/resume", post(resume_run))
}

// ============================================================================
// Helpers
// ============================================================================

fn tenant_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load a run the caller may see. Runs owned by another tenant look
/// missing.
fn load_visible_run(state: &AppState, headers: &HeaderMap, run_id: Uuid) -> Result<Run, RouteError> {
    let not_visible = || not_found(format!("Run {} not found", run_id));
    let run = state
        .run_store()
        .find_run(run_id)
        .map_err(internal_error)?
        .ok_or_else(not_visible)?;

    if let Some(owner) = run.tenant_id.as_deref() {
        if tenant_from_headers(headers).as_deref() != Some(owner) {
            return Err(not_visible());
        }
    }
    Ok(run)
}

fn is_active(status: RunStatus) -> bool {
    matches!(status, RunStatus::Queued | RunStatus::Running)
}

fn to_sse_event(event: &RunEvent) -> Event {
    Event::default().event(event.name.as_str()).data(event.data())
}

/// Forward live events until `stream.end`. Without a receiver the stream
/// ends straight away.
fn live_events(
    run_id: Uuid,
    rx: Option<broadcast::Receiver<RunEvent>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(rx), move |state| async move {
        let mut rx = match state? {
            Some(rx) => rx,
            None => {
                let end = RunEvent::new(run_id, STREAM_END, serde_json::json!({}));
                return Some((Ok(to_sse_event(&end)), None));
            }
        };
        loop {
            match rx.recv().await {
                Ok(event) if event.is_stream_end() => {
                    return Some((Ok(to_sse_event(&event)), None));
                }
                Ok(event) => return Some((Ok(to_sse_event(&event)), Some(Some(rx)))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Stream for run {} skipped {} events", run_id, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let end = RunEvent::new(run_id, STREAM_END, serde_json::json!({}));
                    return Some((Ok(to_sse_event(&end)), None));
                }
            }
        }
    })
}
