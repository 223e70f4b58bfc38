//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::config::FeatureFlags;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    data_dir: String,
    /// Free global run slots; absent when the gate is unbounded
    available_slots: Option<usize>,
    paused: bool,
    exit_requested: bool,
    features: FeatureFlags,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let controller = state.controller();
    let status = if controller.signal().exit_requested() {
        "shutting_down"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        data_dir: state.config().data_dir.to_string_lossy().to_string(),
        available_slots: controller.gate().available_global(),
        paused: controller.signal().is_paused(),
        exit_requested: controller.signal().exit_requested(),
        features: state.config().features,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
