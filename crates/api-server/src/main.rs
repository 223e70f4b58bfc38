//! API Server for the desktop agent runner
//!
//! Serves the run API over HTTP: run creation, inspection, live event
//! streams, the durable audit log, handback resume and operator controls.

mod config;
mod routes;
mod state;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_runner::CancellationSignal;

use crate::config::ServerConfig;
use crate::state::AppState;

fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::runs::router())
        .merge(routes::control::router())
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_server=debug,agent_runner=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    tracing::info!("Using data directory: {:?}", config.data_dir);
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    let signal = Arc::new(CancellationSignal::new());
    signal.install_signal_handlers();

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, Arc::clone(&signal));

    let dispatched = state
        .controller()
        .recover()
        .context("Failed to recover runs from the data directory")?;
    tracing::info!("Dispatched {} queued runs from a previous process", dispatched);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("REST API listening on {}", bind_addr);

    let controller = state.controller().clone();
    let exit = signal.exit_token();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            exit.cancelled().await;
            tracing::info!("Shutting down gracefully");
        })
        .await
        .context("Server error")?;

    // Runs record their clean exit before the runtime goes away
    controller.shutdown().await;
    tracing::info!("All run tasks stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_runner::testing::{collaborators_with, shared_factory, ScriptedPredictor};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_gate_and_signal() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_concurrent_runs: 3,
            ..ServerConfig::default()
        };
        let state = AppState::with_factory(
            config,
            Arc::new(CancellationSignal::new()),
            shared_factory(collaborators_with(Arc::new(ScriptedPredictor::new(["DONE"])))),
        );

        let response = app(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["availableSlots"], 3);
        assert_eq!(body["paused"], false);
        assert_eq!(body["features"]["reflection"], true);
    }
}
