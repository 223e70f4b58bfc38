//! Event taxonomy for run telemetry
//!
//! Every event carries a dot-namespaced name and a JSON payload. Only the
//! names in [`PERSISTED_EVENTS`] are written to the durable audit log; the
//! whitelist is fixed so audit growth does not depend on payload contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const RUN_STARTED: &str = "runner.run.started";
pub const RUN_COMPLETED: &str = "runner.run.completed";
pub const RUN_ERROR: &str = "runner.run.error";
pub const RUN_EXITED: &str = "runner.run.exited";
pub const STEP_STARTED: &str = "runner.step.started";
pub const STEP_PREDICTED: &str = "runner.step.predicted";
pub const STEP_COMPLETED: &str = "runner.step.completed";
pub const STEP_EXECUTION_FAILED: &str = "runner.step.execution_failed";
pub const SCREENSHOT_CAPTURED: &str = "runner.screenshot.captured";
pub const NARRATION_FAILED: &str = "runner.narration.failed";
pub const HANDBACK_REQUIRED: &str = "runner.handback.required";
pub const HANDBACK_RESUMED: &str = "runner.handback.resumed";
pub const HANDBACK_INFERENCE: &str = "runner.handback.inference";
pub const KEEPALIVE: &str = "keepalive";
/// Final event of a live stream; the transport closes after it
pub const STREAM_END: &str = "stream.end";

/// Event names that cross the ephemeral/durable boundary
pub const PERSISTED_EVENTS: &[&str] = &[
    RUN_STARTED,
    STEP_COMPLETED,
    STEP_EXECUTION_FAILED,
    RUN_COMPLETED,
    RUN_ERROR,
    RUN_EXITED,
    HANDBACK_REQUIRED,
    HANDBACK_RESUMED,
];

/// Whether an event name belongs to the durable subset
pub fn is_persisted(name: &str) -> bool {
    PERSISTED_EVENTS.contains(&name)
}

/// A single published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RunEvent {
    pub fn new(run_id: Uuid, name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            name: name.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn keepalive(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self::new(run_id, KEEPALIVE, serde_json::json!({ "timestamp": now.to_rfc3339() }))
    }

    pub fn is_persisted(&self) -> bool {
        is_persisted(&self.name)
    }

    pub fn is_stream_end(&self) -> bool {
        self.name == STREAM_END
    }

    /// Frame the event for a server-sent event stream:
    /// `event: <name>`, `data: <json>`, then a blank line.
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name, self.data())
    }

    /// Payload as the single-line JSON carried in an SSE `data:` field
    pub fn data(&self) -> String {
        serde_json::to_string(&self.payload).unwrap_or_else(|_| "null".to_string())
    }
}
