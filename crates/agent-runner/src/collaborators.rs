//! External collaborators consumed by the step loop
//!
//! Every call here is a fallible remote call. The loop never retries them;
//! retry, if any, belongs to the implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use cua_core::run::{ChatMessage, Run};

use crate::error::{Result, RunnerError};

/// Opaque result map returned by the remote desktop
pub type ExecutionResult = serde_json::Map<String, serde_json::Value>;

pub fn encode_screenshot(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_screenshot(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| RunnerError::vm(format!("Invalid screenshot encoding: {}", e)))
}

/// Remote desktop the agent acts on
#[async_trait]
pub trait VmSession: Send + Sync {
    async fn execute(&self, payload: &str) -> Result<ExecutionResult>;

    /// PNG bytes of the current screen
    async fn capture_screenshot(&self) -> Result<Vec<u8>>;

    async fn screen_size(&self) -> Result<(u32, u32)>;

    async fn platform(&self) -> Result<String>;

    async fn wait_for_health(&self, timeout: Duration) -> Result<()>;
}

/// What the predictor sees at the start of a step
#[derive(Debug, Clone)]
pub struct Observation {
    pub step_index: u32,
    /// Most recent screenshot
    pub screenshot: Vec<u8>,
    /// Screenshot taken after the post-click settle delay, if one was taken
    pub reflection_screenshot: Option<Vec<u8>>,
    /// Narration of what the previous step did on screen
    pub previous_behavior: Option<Narration>,
    /// Conversation so far, including spliced human handback turns
    pub messages: Vec<ChatMessage>,
    pub platform: String,
    pub enable_reflection: bool,
    pub enable_code_execution: bool,
}

/// Side information returned with a prediction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionInfo {
    pub plan: String,
    pub reflection: Option<String>,
    pub reflection_thoughts: Option<String>,
    /// Executable code derived from the plan; falls back to the raw action
    pub exec_code: Option<String>,
    /// Collaborator-specific payload, passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub info: PredictionInfo,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl Prediction {
    /// The action the step loop classifies; empty when none was returned
    pub fn primary_action(&self) -> &str {
        self.actions.first().map(String::as_str).unwrap_or("")
    }
}

#[async_trait]
pub trait AgentPredictor: Send + Sync {
    async fn predict(&self, task: &str, observation: &Observation) -> Result<Prediction>;
}

/// Description of what an action visibly did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Narration {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
}

impl Narration {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[async_trait]
pub trait BehaviorNarrator: Send + Sync {
    async fn narrate(&self, before: &[u8], after: &[u8], action: &str) -> Result<Narration>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Judgment of what a human changed while the run was paused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    pub changes_observed: String,
    pub request_fulfilled: bool,
    pub confidence: Confidence,
    #[serde(default)]
    pub details: String,
}

impl InferenceResult {
    /// Text of the synthetic conversation turn spliced in on resume
    pub fn to_turn(&self, request: &str) -> String {
        let mut text = format!(
            "The run was handed back to a human with the request: \"{}\".\n\
             Changes observed: {}\n\
             Request fulfilled: {} (confidence: {})",
            request,
            self.changes_observed,
            if self.request_fulfilled { "yes" } else { "no" },
            self.confidence.as_str()
        );
        if !self.details.trim().is_empty() {
            text.push_str(&format!("\nDetails: {}", self.details.trim()));
        }
        text
    }
}

#[async_trait]
pub trait HumanInference: Send + Sync {
    async fn infer(&self, request: &str, before_b64: &str, after_b64: &str) -> Result<InferenceResult>;
}

/// A collaborator whose state must survive a handback pause
#[async_trait]
pub trait ComponentState: Send + Sync {
    /// Key under which the state is stored in the snapshot
    fn component_name(&self) -> &str;

    async fn export_state(&self) -> Result<serde_json::Value>;

    async fn import_state(&self, state: serde_json::Value) -> Result<()>;
}

/// Everything one run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub vm: Arc<dyn VmSession>,
    pub predictor: Arc<dyn AgentPredictor>,
    pub narrator: Arc<dyn BehaviorNarrator>,
    pub inference: Arc<dyn HumanInference>,
    /// Collaborators with resumable state, captured in every snapshot
    pub components: Vec<Arc<dyn ComponentState>>,
}

impl Collaborators {
    pub fn component(&self, name: &str) -> Option<&Arc<dyn ComponentState>> {
        self.components.iter().find(|c| c.component_name() == name)
    }
}

/// Builds the collaborators for a run
pub trait CollaboratorFactory: Send + Sync {
    fn build(&self, run: &Run) -> Result<Collaborators>;
}

impl<F> CollaboratorFactory for F
where
    F: Fn(&Run) -> Result<Collaborators> + Send + Sync,
{
    fn build(&self, run: &Run) -> Result<Collaborators> {
        self(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_screenshot_base64_round_trip() {
        let bytes = vec![0x89, b'P', b'N', b'G', 0, 255];
        let encoded = encode_screenshot(&bytes);
        assert_eq!(decode_screenshot(&encoded).unwrap(), bytes);
        assert!(decode_screenshot("not base64!").is_err());
    }

    #[test]
    fn test_prediction_keeps_extra_info() {
        let prediction: Prediction = serde_json::from_value(json!({
            "info": { "plan": "open menu", "exec_code": "click(1,2)", "grounding": { "x": 1 } },
            "actions": ["click(1,2)"]
        }))
        .unwrap();

        assert_eq!(prediction.primary_action(), "click(1,2)");
        assert_eq!(prediction.info.exec_code.as_deref(), Some("click(1,2)"));
        assert_eq!(prediction.info.extra["grounding"], json!({ "x": 1 }));
        assert_eq!(Prediction::default().primary_action(), "");
    }

    #[test]
    fn test_inference_turn_mentions_request_and_confidence() {
        let inference = InferenceResult {
            changes_observed: "user is now signed in".to_string(),
            request_fulfilled: true,
            confidence: Confidence::High,
            details: String::new(),
        };

        let turn = inference.to_turn("please sign in");
        assert!(turn.contains("\"please sign in\""));
        assert!(turn.contains("Request fulfilled: yes (confidence: high)"));
        assert!(!turn.contains("Details"));
    }

    #[test]
    fn test_inference_wire_format() {
        let inference: InferenceResult = serde_json::from_value(json!({
            "changesObserved": "dialog closed",
            "requestFulfilled": false,
            "confidence": "low"
        }))
        .unwrap();

        assert_eq!(inference.confidence, Confidence::Low);
        assert!(inference.details.is_empty());
    }
}
