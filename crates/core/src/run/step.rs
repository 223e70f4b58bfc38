//! Step records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of action a step carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// A regular GUI-level step (including waits and terminal DONE/FAIL)
    Gui,
    /// The agent handed control back to a human
    Handback,
}

/// One completed step of a run.
///
/// Records are append-only: the step loop creates one per completed step and
/// never mutates it after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based, strictly increasing within a run
    pub step_index: u32,

    /// Plan text produced by the predictor
    pub plan: String,

    /// Raw action string as predicted
    pub action: String,

    /// Payload sent to the remote desktop (empty for non-executing steps)
    pub exec_payload: String,

    /// Opaque result map returned by the remote desktop
    #[serde(default)]
    pub execution_result: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_thoughts: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior_thoughts: Option<String>,

    pub action_kind: ActionKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handback_request: Option<String>,

    /// Base64 screenshot taken when the run paused for a human
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handback_screenshot: Option<String>,

    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    /// Create a GUI step record with empty optional fields
    pub fn new(step_index: u32, plan: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            step_index,
            plan: plan.into(),
            action: action.into(),
            exec_payload: String::new(),
            execution_result: serde_json::Map::new(),
            reflection: None,
            reflection_thoughts: None,
            behavior: None,
            behavior_thoughts: None,
            action_kind: ActionKind::Gui,
            handback_request: None,
            handback_screenshot: None,
            completed_at: Utc::now(),
        }
    }

    pub fn is_handback(&self) -> bool {
        self.action_kind == ActionKind::Handback
    }

    /// Render this step as a transcript section
    pub fn render(&self) -> String {
        let mut out = format!("### Step {}\n", self.step_index);
        if !self.plan.is_empty() {
            out.push_str(&format!("Plan: {}\n", self.plan));
        }
        out.push_str(&format!("Action: {}\n", self.action));
        if !self.exec_payload.is_empty() && self.exec_payload != self.action {
            out.push_str(&format!("Executed: {}\n", self.exec_payload));
        }
        if let Some(status) = self.execution_result.get("status").and_then(|v| v.as_str()) {
            out.push_str(&format!("Result: {}\n", status));
        }
        if let Some(reflection) = self.reflection.as_deref().filter(|r| !r.is_empty()) {
            out.push_str(&format!("Reflection: {}\n", reflection));
        }
        if let Some(behavior) = self.behavior.as_deref().filter(|b| !b.is_empty()) {
            out.push_str(&format!("Observed behavior: {}\n", behavior));
        }
        if let Some(request) = &self.handback_request {
            out.push_str(&format!("Handback request: {}\n", request));
        }
        out
    }
}
