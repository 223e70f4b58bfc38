//! Handback snapshots
//!
//! A snapshot is written when the agent pauses for a human and is the single
//! source of truth for the later resume. It carries the serialized resumable
//! state of every collaborating component, keyed by component name, and is
//! always written as a whole: a new pause replaces the previous snapshot for
//! the run, it is never merged into it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::{ChatMessage, StepRecord};
use crate::{Error, Result};

/// Component key under which the step runner stores its own state
pub const RUNNER_COMPONENT: &str = "runner";

/// The step runner's resumable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerState {
    /// Work item the paused loop was executing
    pub work_item_id: Option<Uuid>,
    /// Step index the resumed loop starts at
    pub next_step_index: u32,
    /// Steps completed so far, including the handback step
    pub steps: Vec<StepRecord>,
    /// Conversation the predictor sees as prior context
    pub messages: Vec<ChatMessage>,
    /// Rendered partial trajectory
    pub trajectory: String,
    pub request: String,
    pub screenshot_b64: String,
    pub paused_at: DateTime<Utc>,
}

/// Full cross-component snapshot of a paused run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandbackSnapshot {
    pub run_id: Uuid,
    /// Human-facing request text
    pub request: String,
    /// Base64 screenshot captured at pause time
    pub screenshot_b64: String,
    pub created_at: DateTime<Utc>,
    /// Step index at which the pause occurred
    pub step_index: u32,
    /// Serialized state of every collaborating component, keyed by name
    pub components: BTreeMap<String, serde_json::Value>,
}

impl HandbackSnapshot {
    /// Build a snapshot from the runner's state plus every other component
    pub fn new(
        run_id: Uuid,
        step_index: u32,
        runner: &RunnerState,
        mut components: BTreeMap<String, serde_json::Value>,
    ) -> Result<Self> {
        components.insert(RUNNER_COMPONENT.to_string(), serde_json::to_value(runner)?);
        Ok(Self {
            run_id,
            request: runner.request.clone(),
            screenshot_b64: runner.screenshot_b64.clone(),
            created_at: runner.paused_at,
            step_index,
            components,
        })
    }

    /// Decode the runner's own portion
    pub fn runner_state(&self) -> Result<RunnerState> {
        let value = self
            .components
            .get(RUNNER_COMPONENT)
            .ok_or_else(|| Error::NotFound(format!("snapshot component '{}'", RUNNER_COMPONENT)))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Every component's state except the runner's, preserved as-is
    pub fn other_components(&self) -> BTreeMap<String, serde_json::Value> {
        self.components
            .iter()
            .filter(|(name, _)| name.as_str() != RUNNER_COMPONENT)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Replace the runner's portion, keeping the other components untouched
    pub fn with_runner_state(mut self, runner: &RunnerState) -> Result<Self> {
        self.components
            .insert(RUNNER_COMPONENT.to_string(), serde_json::to_value(runner)?);
        self.request = runner.request.clone();
        self.screenshot_b64 = runner.screenshot_b64.clone();
        Ok(self)
    }
}
