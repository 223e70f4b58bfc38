//! Scripted collaborators for tests
//!
//! Compiled for this crate's tests and, behind the `testing` feature, for
//! downstream crates' tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use cua_core::run::Run;

use crate::collaborators::{
    AgentPredictor, BehaviorNarrator, CollaboratorFactory, Collaborators, ComponentState,
    Confidence, ExecutionResult, HumanInference, InferenceResult, Narration, Observation,
    Prediction, PredictionInfo, VmSession,
};
use crate::error::{Result, RunnerError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remote desktop double that records executed payloads
#[derive(Debug, Default)]
pub struct MockVm {
    executed: Mutex<Vec<String>>,
    screenshots: AtomicUsize,
    fail_executions: AtomicBool,
}

impl MockVm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_executions(&self, fail: bool) {
        self.fail_executions.store(fail, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn screenshots_taken(&self) -> usize {
        self.screenshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VmSession for MockVm {
    async fn execute(&self, payload: &str) -> Result<ExecutionResult> {
        lock(&self.executed).push(payload.to_string());
        if self.fail_executions.load(Ordering::SeqCst) {
            return Err(RunnerError::vm("element not found"));
        }
        let mut result = ExecutionResult::new();
        result.insert("status".to_string(), json!("success"));
        Ok(result)
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        let n = self.screenshots.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("screen-{}", n).into_bytes())
    }

    async fn screen_size(&self) -> Result<(u32, u32)> {
        Ok((1920, 1080))
    }

    async fn platform(&self) -> Result<String> {
        Ok("linux".to_string())
    }

    async fn wait_for_health(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Predictor that replays a fixed list of actions, then a fallback action
#[derive(Debug)]
pub struct ScriptedPredictor {
    script: Mutex<VecDeque<String>>,
    fallback: String,
    exec_codes: Mutex<HashMap<usize, String>>,
    fail_at: Mutex<Option<usize>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    observations: Mutex<Vec<Observation>>,
}

impl ScriptedPredictor {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(actions.into_iter().map(Into::into).collect()),
            fallback: "WAIT".to_string(),
            exec_codes: Mutex::new(HashMap::new()),
            fail_at: Mutex::new(None),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            observations: Mutex::new(Vec::new()),
        }
    }

    /// Action returned once the script is exhausted
    pub fn with_fallback(mut self, action: impl Into<String>) -> Self {
        self.fallback = action.into();
        self
    }

    /// Time each prediction takes
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Attach executable code to the n-th call (1-based)
    pub fn set_exec_code(&self, call: usize, code: impl Into<String>) {
        lock(&self.exec_codes).insert(call, code.into());
    }

    /// Make the n-th call (1-based) fail
    pub fn fail_at(&self, call: usize) {
        *lock(&self.fail_at) = Some(call);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of predictions that were in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn observations(&self) -> Vec<Observation> {
        lock(&self.observations).clone()
    }
}

#[async_trait]
impl AgentPredictor for ScriptedPredictor {
    async fn predict(&self, _task: &str, observation: &Observation) -> Result<Prediction> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.observations).push(observation.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if *lock(&self.fail_at) == Some(call) {
            return Err(RunnerError::predictor("model endpoint unavailable"));
        }

        let action = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(Prediction {
            info: PredictionInfo {
                plan: format!("step {}", observation.step_index),
                exec_code: lock(&self.exec_codes).get(&call).cloned(),
                ..PredictionInfo::default()
            },
            actions: vec![action],
        })
    }
}

/// Narrator that always says the same thing, or always fails
#[derive(Debug, Default)]
pub struct StaticNarrator {
    text: String,
    fail: bool,
}

impl StaticNarrator {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            text: String::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl BehaviorNarrator for StaticNarrator {
    async fn narrate(&self, _before: &[u8], _after: &[u8], _action: &str) -> Result<Narration> {
        if self.fail {
            return Err(RunnerError::predictor("narration model timed out"));
        }
        Ok(Narration {
            text: self.text.clone(),
            thoughts: None,
        })
    }
}

/// Inference service with a fixed answer
#[derive(Debug)]
pub struct StaticInference {
    result: Option<InferenceResult>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticInference {
    pub fn new(result: InferenceResult) -> Self {
        Self {
            result: Some(result),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fulfilled() -> Self {
        Self::new(InferenceResult {
            changes_observed: "the user signed in".to_string(),
            request_fulfilled: true,
            confidence: Confidence::High,
            details: String::new(),
        })
    }

    pub fn failing() -> Self {
        Self {
            result: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering, like a slow vision model
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HumanInference for StaticInference {
    async fn infer(&self, _request: &str, _before_b64: &str, _after_b64: &str) -> Result<InferenceResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result
            .clone()
            .ok_or_else(|| RunnerError::inference("inference service unavailable"))
    }
}

/// Resumable component holding a JSON value
#[derive(Debug)]
pub struct MemoryComponent {
    name: String,
    state: Mutex<serde_json::Value>,
}

impl MemoryComponent {
    pub fn new(name: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(state),
        }
    }

    pub fn get(&self) -> serde_json::Value {
        lock(&self.state).clone()
    }

    pub fn set(&self, state: serde_json::Value) {
        *lock(&self.state) = state;
    }
}

#[async_trait]
impl ComponentState for MemoryComponent {
    fn component_name(&self) -> &str {
        &self.name
    }

    async fn export_state(&self) -> Result<serde_json::Value> {
        Ok(self.get())
    }

    async fn import_state(&self, state: serde_json::Value) -> Result<()> {
        self.set(state);
        Ok(())
    }
}

/// Factory handing every run the same collaborators
pub fn shared_factory(collaborators: Collaborators) -> Arc<dyn CollaboratorFactory> {
    Arc::new(move |_run: &Run| -> Result<Collaborators> { Ok(collaborators.clone()) })
}

/// Collaborators around the given predictor with default doubles elsewhere
pub fn collaborators_with(predictor: Arc<ScriptedPredictor>) -> Collaborators {
    Collaborators {
        vm: Arc::new(MockVm::new()),
        predictor,
        narrator: Arc::new(StaticNarrator::new("the screen changed")),
        inference: Arc::new(StaticInference::fulfilled()),
        components: Vec::new(),
    }
}
