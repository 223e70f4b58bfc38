//! Operator controls over the process-wide cancellation signal

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::info;

use crate::state::AppState;

use super::{bad_request, RouteError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStateResponse {
    pub paused: bool,
    pub exit_requested: bool,
}

fn control_state(state: &AppState) -> ControlStateResponse {
    let signal = state.controller().signal();
    ControlStateResponse {
        paused: signal.is_paused(),
        exit_requested: signal.exit_requested(),
    }
}

/// GET /api/v1/control - Current pause and exit state
async fn get_control(State(state): State<AppState>) -> Json<ControlStateResponse> {
    Json(control_state(&state))
}

/// POST /api/v1/control/{action} - Pause, resume or request a clean exit
async fn apply_control(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Result<Json<ControlStateResponse>, RouteError> {
    let signal = state.controller().signal();
    match action.as_str() {
        "pause" => signal.pause(),
        "resume" => signal.resume(),
        "exit" => signal.request_exit(),
        other => return Err(bad_request(format!("Unknown control action: {}", other))),
    }
    info!("Operator control applied: {}", action);
    Ok(Json(control_state(&state)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/control", get(get_control))
        .route("/api/v1/control/{action}", post(apply_control))
}
