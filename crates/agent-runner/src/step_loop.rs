//! The per-run step loop
//!
//! Observe, predict, classify, execute, capture, narrate, record; then
//! continue or stop. The loop checks the cancellation signal before
//! prediction, before execution and before every continuing screenshot
//! capture, and never inside a remote call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cua_core::event::{
    NARRATION_FAILED, SCREENSHOT_CAPTURED, STEP_COMPLETED, STEP_EXECUTION_FAILED, STEP_PREDICTED,
    STEP_STARTED,
};
use cua_core::run::{
    ActionKind, ChatMessage, CompletionReason, ResultStatus, RunConfig, RunResult, StepRecord,
};
use cua_core::snapshot::RunnerState;

use crate::bus::emit;
use crate::cancel::{CancellationSignal, Checkpoint};
use crate::classify::{classify, Action};
use crate::collaborators::{encode_screenshot, Collaborators, Narration, Observation, Prediction};
use crate::error::Result;
use crate::handback::HandbackManager;

/// Default sleep for `WAIT` and empty actions
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a loop needs that does not change while it runs
#[derive(Clone)]
pub struct LoopContext {
    pub run_id: Uuid,
    /// Work item being executed, if the run has a plan
    pub work_item_id: Option<Uuid>,
    /// Task text handed to the predictor
    pub task: String,
    pub config: RunConfig,
    pub collaborators: Collaborators,
    pub signal: Arc<CancellationSignal>,
    pub handback: HandbackManager,
    pub wait_interval: Duration,
}

/// Whether a payload is a pointer click, which gets a settle delay
fn is_click(payload: &str) -> bool {
    let payload = payload.to_ascii_lowercase();
    payload.contains("click(") || payload.contains("click (")
}

pub struct StepLoop {
    ctx: LoopContext,
    next_step_index: u32,
    steps: Vec<StepRecord>,
    messages: Vec<ChatMessage>,
    /// Baseline screenshot for the next step
    screenshot: Option<Vec<u8>>,
    reflection_screenshot: Option<Vec<u8>>,
    previous_behavior: Option<Narration>,
}

impl StepLoop {
    pub fn new(ctx: LoopContext) -> Self {
        Self {
            ctx,
            next_step_index: 1,
            steps: Vec::new(),
            messages: Vec::new(),
            screenshot: None,
            reflection_screenshot: None,
            previous_behavior: None,
        }
    }

    /// Continue a paused loop from its saved state, with `baseline` as the
    /// screenshot the first resumed step observes
    pub fn resume(ctx: LoopContext, state: RunnerState, baseline: Vec<u8>) -> Self {
        Self {
            ctx,
            next_step_index: state.next_step_index.max(1),
            steps: state.steps,
            messages: state.messages,
            screenshot: Some(baseline),
            reflection_screenshot: None,
            previous_behavior: None,
        }
    }

    /// The loop's resumable state
    pub fn runner_state(&self, request: String, screenshot_b64: String, trajectory: String) -> RunnerState {
        RunnerState {
            work_item_id: self.ctx.work_item_id,
            next_step_index: self.next_step_index,
            steps: self.steps.clone(),
            messages: self.messages.clone(),
            trajectory,
            request,
            screenshot_b64,
            paused_at: Utc::now(),
        }
    }

    /// Result with the steps recorded so far, for an error that escaped
    /// the loop
    pub fn errored(&self, error: impl Into<String>) -> RunResult {
        RunResult::errored(self.ctx.task.clone(), self.steps.clone(), error)
            .with_handback_notes(&self.messages)
    }

    fn finish(&self, status: ResultStatus, reason: CompletionReason) -> RunResult {
        debug!(
            "Run {} loop finished: {} ({}) after {} steps",
            self.ctx.run_id,
            status.as_str(),
            reason.as_str(),
            self.steps.len()
        );
        RunResult::new(self.ctx.task.clone(), status, reason, self.steps.clone())
            .with_handback_notes(&self.messages)
    }

    fn clean_exit(&self) -> RunResult {
        info!("Run {} stopping via clean exit", self.ctx.run_id);
        self.finish(ResultStatus::InProgress, CompletionReason::CleanExit)
    }

    /// Drive the loop until a terminal action, a handback, the step budget
    /// or a clean exit. Collaborator errors that are not downgraded at the
    /// call site propagate; the steps recorded so far stay available
    /// through [`StepLoop::errored`].
    pub async fn run(&mut self) -> Result<RunResult> {
        if self.screenshot.is_none() {
            match self.checked_capture(0).await? {
                Some(shot) => self.screenshot = Some(shot),
                None => return Ok(self.clean_exit()),
            }
        }

        while self.next_step_index <= self.ctx.config.max_steps {
            let step_index = self.next_step_index;

            if self.ctx.signal.checkpoint().await.is_exit() {
                return Ok(self.clean_exit());
            }

            emit(STEP_STARTED, json!({ "step_index": step_index })).await;

            let observation = self.observe(step_index);
            let prediction = self
                .ctx
                .collaborators
                .predictor
                .predict(&self.ctx.task, &observation)
                .await?;
            let raw = prediction.primary_action().to_string();
            emit(
                STEP_PREDICTED,
                json!({
                    "step_index": step_index,
                    "plan": prediction.info.plan,
                    "action": raw,
                }),
            )
            .await;

            let mut record = self.new_record(step_index, &prediction);
            let before = observation.screenshot;

            let action = classify(&raw);
            debug!("Run {} step {} classified as {:?}", self.ctx.run_id, step_index, action);

            match action {
                Action::Done | Action::Fail => {
                    let after = self.capture(step_index).await?;
                    self.narrate(&before, &after, &raw, &mut record).await;
                    self.screenshot = Some(after);
                    self.record(record).await;

                    return Ok(if action == Action::Done {
                        self.finish(ResultStatus::Success, CompletionReason::Done)
                    } else {
                        self.finish(ResultStatus::Failed, CompletionReason::Fail)
                    });
                }
                Action::Handback(request) => {
                    return self.pause(record, request, step_index).await;
                }
                Action::Wait | Action::Noop => {
                    if !self.ctx.signal.sleep_interruptible(self.ctx.wait_interval).await {
                        return Ok(self.clean_exit());
                    }
                    let Some(after) = self.checked_capture(step_index).await? else {
                        return Ok(self.clean_exit());
                    };
                    self.narrate(&before, &after, &raw, &mut record).await;
                    self.screenshot = Some(after);
                    self.reflection_screenshot = None;
                }
                Action::Execute(payload) => {
                    let exec = prediction
                        .info
                        .exec_code
                        .clone()
                        .filter(|code| !code.trim().is_empty())
                        .unwrap_or(payload);

                    if self.ctx.signal.checkpoint().await.is_exit() {
                        return Ok(self.clean_exit());
                    }
                    record.execution_result = self.execute(step_index, &exec).await;
                    record.exec_payload = exec.clone();

                    if !self
                        .ctx
                        .signal
                        .sleep_interruptible(self.ctx.config.post_action_delay())
                        .await
                    {
                        self.record(record).await;
                        return Ok(self.clean_exit());
                    }
                    let Some(after) = self.checked_capture(step_index).await? else {
                        self.record(record).await;
                        return Ok(self.clean_exit());
                    };

                    let settled = match self.settle_after_click(step_index, &exec).await? {
                        Checkpoint::Exit => {
                            self.record(record).await;
                            return Ok(self.clean_exit());
                        }
                        Checkpoint::Continue => self.reflection_screenshot.clone(),
                    };

                    let narrated_after = settled.as_deref().unwrap_or(&after).to_vec();
                    self.narrate(&before, &narrated_after, &exec, &mut record).await;
                    self.screenshot = Some(after);
                }
            }

            self.record(record).await;
        }

        info!(
            "Run {} exhausted its budget of {} steps",
            self.ctx.run_id, self.ctx.config.max_steps
        );
        Ok(self.finish(ResultStatus::Timeout, CompletionReason::MaxSteps))
    }

    fn observe(&self, step_index: u32) -> Observation {
        Observation {
            step_index,
            screenshot: self
                .reflection_screenshot
                .clone()
                .or_else(|| self.screenshot.clone())
                .unwrap_or_default(),
            reflection_screenshot: self.reflection_screenshot.clone(),
            previous_behavior: self.previous_behavior.clone(),
            messages: self.messages.clone(),
            platform: self.ctx.config.platform.clone(),
            enable_reflection: self.ctx.config.enable_reflection,
            enable_code_execution: self.ctx.config.enable_code_execution,
        }
    }

    fn new_record(&self, step_index: u32, prediction: &Prediction) -> StepRecord {
        let mut record = StepRecord::new(step_index, prediction.info.plan.clone(), prediction.primary_action());
        if self.ctx.config.enable_reflection {
            record.reflection = prediction.info.reflection.clone();
            record.reflection_thoughts = prediction.info.reflection_thoughts.clone();
        }
        record
    }

    /// Send a payload to the remote desktop. A failed execution is recorded
    /// in the step's result and the loop goes on.
    async fn execute(&self, step_index: u32, payload: &str) -> serde_json::Map<String, serde_json::Value> {
        match self.ctx.collaborators.vm.execute(payload).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Run {} step {} execution failed: {}", self.ctx.run_id, step_index, e);
                emit(
                    STEP_EXECUTION_FAILED,
                    json!({ "step_index": step_index, "payload": payload, "error": e.to_string() }),
                )
                .await;
                let mut result = serde_json::Map::new();
                result.insert("status".to_string(), json!("error"));
                result.insert("message".to_string(), json!(e.to_string()));
                result
            }
        }
    }

    /// After a click, wait for the UI to settle and take the screenshot the
    /// next step uses as its baseline
    async fn settle_after_click(&mut self, step_index: u32, payload: &str) -> Result<Checkpoint> {
        self.reflection_screenshot = None;
        let Some(delay) = self.ctx.config.click_settle_delay() else {
            return Ok(Checkpoint::Continue);
        };
        if !is_click(payload) {
            return Ok(Checkpoint::Continue);
        }

        if !self.ctx.signal.sleep_interruptible(delay).await {
            return Ok(Checkpoint::Exit);
        }
        match self.checked_capture(step_index).await? {
            Some(delayed) => {
                self.reflection_screenshot = Some(delayed);
                Ok(Checkpoint::Continue)
            }
            None => Ok(Checkpoint::Exit),
        }
    }

    async fn capture(&self, step_index: u32) -> Result<Vec<u8>> {
        let shot = self.ctx.collaborators.vm.capture_screenshot().await?;
        emit(
            SCREENSHOT_CAPTURED,
            json!({ "step_index": step_index, "bytes": shot.len() }),
        )
        .await;
        Ok(shot)
    }

    /// Capture unless exit was requested; `None` means unwind
    async fn checked_capture(&self, step_index: u32) -> Result<Option<Vec<u8>>> {
        if self.ctx.signal.checkpoint().await.is_exit() {
            return Ok(None);
        }
        self.capture(step_index).await.map(Some)
    }

    /// Describe what the step did on screen. Never fatal.
    async fn narrate(&mut self, before: &[u8], after: &[u8], action: &str, record: &mut StepRecord) {
        let narration = match self.ctx.collaborators.narrator.narrate(before, after, action).await {
            Ok(narration) => narration,
            Err(e) => {
                warn!(
                    "Run {} step {} narration failed: {}",
                    self.ctx.run_id, record.step_index, e
                );
                emit(
                    NARRATION_FAILED,
                    json!({ "step_index": record.step_index, "error": e.to_string() }),
                )
                .await;
                Narration::default()
            }
        };

        if !narration.is_empty() {
            record.behavior = Some(narration.text.clone());
            record.behavior_thoughts = narration.thoughts.clone();
        }
        self.previous_behavior = Some(narration);
    }

    async fn record(&mut self, record: StepRecord) {
        let step_index = record.step_index;

        let mut turn = format!("Action: {}", record.action);
        if !record.plan.is_empty() {
            turn = format!("Plan: {}\n{}", record.plan, turn);
        }
        self.messages
            .push(ChatMessage::assistant(turn).with_type("step").at_step(step_index));
        if let Some(behavior) = &record.behavior {
            self.messages.push(
                ChatMessage::user(behavior.clone())
                    .with_type("observation")
                    .at_step(step_index),
            );
        }

        emit(
            STEP_COMPLETED,
            json!({
                "step_index": step_index,
                "action": record.action,
                "action_kind": record.action_kind,
                "exec_payload": record.exec_payload,
                "execution_status": record.execution_result.get("status"),
                "behavior": record.behavior,
            }),
        )
        .await;

        self.steps.push(record);
        self.next_step_index = step_index + 1;
    }

    async fn pause(&mut self, mut record: StepRecord, request: String, step_index: u32) -> Result<RunResult> {
        let shot = self.capture(step_index).await?;
        let screenshot_b64 = encode_screenshot(&shot);

        record.action_kind = ActionKind::Handback;
        record.handback_request = Some(request.clone());
        record.handback_screenshot = Some(screenshot_b64.clone());
        self.screenshot = Some(shot);
        self.record(record).await;

        let state = self.runner_state(request, screenshot_b64, String::new());
        Ok(self
            .ctx
            .handback
            .pause(
                self.ctx.run_id,
                &self.ctx.task,
                state,
                &self.ctx.collaborators.components,
            )
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, EventHub, RunEmitter};
    use crate::persistence::RunStore;
    use crate::testing::{MockVm, ScriptedPredictor, StaticInference, StaticNarrator};
    use cua_core::event::RunEvent;
    use cua_core::run::{Run, RunStatus};
    use tempfile::TempDir;

    struct Harness {
        store: RunStore,
        vm: Arc<MockVm>,
        predictor: Arc<ScriptedPredictor>,
        signal: Arc<CancellationSignal>,
        run: Run,
        _temp: TempDir,
    }

    impl Harness {
        fn new<I, S>(actions: I, max_steps: u32) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let temp = TempDir::new().unwrap();
            let store = RunStore::new(temp.path());
            let mut run = Run::new(
                RunConfig::new("open the settings page")
                    .with_max_steps(max_steps)
                    .with_post_action_delay(Duration::ZERO),
                None,
            );
            run.mark_started();
            store.save_run(&run).unwrap();
            Self {
                store,
                vm: Arc::new(MockVm::new()),
                predictor: Arc::new(ScriptedPredictor::new(actions)),
                signal: Arc::new(CancellationSignal::new()),
                run,
                _temp: temp,
            }
        }

        fn context(&self) -> LoopContext {
            LoopContext {
                run_id: self.run.id,
                work_item_id: Some(self.run.plan[0].id),
                task: self.run.config.task.clone(),
                config: self.run.config.clone(),
                collaborators: Collaborators {
                    vm: self.vm.clone(),
                    predictor: self.predictor.clone(),
                    narrator: Arc::new(StaticNarrator::new("the page changed")),
                    inference: Arc::new(StaticInference::fulfilled()),
                    components: Vec::new(),
                },
                signal: self.signal.clone(),
                handback: HandbackManager::new(self.store.clone()),
                wait_interval: Duration::from_millis(1),
            }
        }
    }

    fn assert_strictly_increasing_from_one(steps: &[StepRecord]) {
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.step_index, i as u32 + 1);
        }
    }

    #[tokio::test]
    async fn test_wait_wait_done_succeeds_in_three_steps() {
        let harness = Harness::new(["WAIT", "WAIT", "DONE"], 3);
        let mut step_loop = StepLoop::new(harness.context());

        let result = step_loop.run().await.unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.completion_reason, CompletionReason::Done);
        assert_eq!(result.steps.len(), 3);
        assert_strictly_increasing_from_one(&result.steps);
        assert!(harness.vm.executed().is_empty());
    }

    #[tokio::test]
    async fn test_fail_stops_with_failed_status() {
        let harness = Harness::new(["click(1,1)", "FAIL"], 10);
        let result = StepLoop::new(harness.context()).run().await.unwrap();

        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.completion_reason, CompletionReason::Fail);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(harness.vm.executed(), vec!["click(1,1)".to_string()]);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_timeout() {
        let harness = Harness::new(["click(1,1)", "WAIT", "", "type('x')"], 4);
        let result = StepLoop::new(harness.context()).run().await.unwrap();

        assert_eq!(result.status, ResultStatus::Timeout);
        assert_eq!(result.completion_reason, CompletionReason::MaxSteps);
        assert_eq!(result.steps.len(), 4);
        assert_strictly_increasing_from_one(&result.steps);
    }

    #[tokio::test]
    async fn test_handback_pauses_after_one_step() {
        let harness = Harness::new(["HANDBACK_TO_USER: please sign in"], 5);
        let result = StepLoop::new(harness.context()).run().await.unwrap();

        assert_eq!(result.status, ResultStatus::Attention);
        assert_eq!(result.completion_reason, CompletionReason::AwaitingHuman);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].action_kind, ActionKind::Handback);
        assert_eq!(result.steps[0].handback_request.as_deref(), Some("please sign in"));

        let run = harness.store.load_run(harness.run.id).unwrap();
        assert_eq!(run.status, RunStatus::Attention);
        let snapshot = harness.store.load_snapshot(harness.run.id).unwrap().unwrap();
        assert_eq!(snapshot.request, "please sign in");
        assert_eq!(
            Some(snapshot.screenshot_b64),
            result.steps[0].handback_screenshot
        );
    }

    #[tokio::test]
    async fn test_exec_code_is_preferred_over_raw_action() {
        let harness = Harness::new(["click on the blue button", "DONE"], 5);
        harness.predictor.set_exec_code(1, "pyautogui.click(40, 80)");

        let result = StepLoop::new(harness.context()).run().await.unwrap();

        assert_eq!(harness.vm.executed(), vec!["pyautogui.click(40, 80)".to_string()]);
        assert_eq!(result.steps[0].exec_payload, "pyautogui.click(40, 80)");
        assert_eq!(result.steps[0].action, "click on the blue button");
    }

    #[tokio::test]
    async fn test_execution_failure_is_recorded_and_loop_continues() {
        let harness = Harness::new(["click(1,1)", "DONE"], 5);
        harness.vm.fail_executions(true);

        let result = StepLoop::new(harness.context()).run().await.unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.steps[0].execution_result["status"], "error");
    }

    #[tokio::test]
    async fn test_narration_failure_is_not_fatal() {
        let harness = Harness::new(["WAIT", "DONE"], 5);
        let mut ctx = harness.context();
        ctx.collaborators.narrator = Arc::new(StaticNarrator::failing());

        let result = StepLoop::new(ctx).run().await.unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert!(result.steps.iter().all(|s| s.behavior.is_none()));
    }

    #[tokio::test]
    async fn test_predictor_error_propagates_with_steps_kept() {
        let harness = Harness::new(["WAIT", "WAIT"], 5);
        harness.predictor.fail_at(3);

        let mut step_loop = StepLoop::new(harness.context());
        let err = step_loop.run().await.unwrap_err();
        let result = step_loop.errored(err.to_string());

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.steps.len(), 2);
        assert!(result.error.unwrap().contains("Predictor"));
    }

    #[tokio::test]
    async fn test_exit_requested_before_start_is_clean_exit() {
        let harness = Harness::new(["DONE"], 5);
        harness.signal.request_exit();

        let result = StepLoop::new(harness.context()).run().await.unwrap();

        assert_eq!(result.status, ResultStatus::InProgress);
        assert_eq!(result.completion_reason, CompletionReason::CleanExit);
        assert!(result.steps.is_empty());
        assert_eq!(harness.vm.screenshots_taken(), 0);
    }

    #[tokio::test]
    async fn test_click_settle_takes_delayed_baseline() {
        let harness = Harness::new(["click(5,5)", "DONE"], 5);
        let mut ctx = harness.context();
        ctx.config = ctx.config.with_click_settle_delay(Duration::from_millis(1));

        let result = StepLoop::new(ctx).run().await.unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        // initial, post-click, settled, final
        assert_eq!(harness.vm.screenshots_taken(), 4);
        let observed = harness.predictor.observations();
        assert_eq!(observed.len(), 2);
        assert!(observed[1].reflection_screenshot.is_some());
        assert_eq!(Some(observed[1].screenshot.clone()), observed[1].reflection_screenshot);
    }

    #[tokio::test]
    async fn test_previous_behavior_reaches_next_observation() {
        let harness = Harness::new(["WAIT", "DONE"], 5);
        StepLoop::new(harness.context()).run().await.unwrap();

        let observed = harness.predictor.observations();
        assert!(observed[0].previous_behavior.is_none());
        assert_eq!(
            observed[1].previous_behavior.as_ref().map(|n| n.text.as_str()),
            Some("the page changed")
        );
        assert_eq!(observed[1].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_step_order() {
        let harness = Harness::new(["WAIT", "DONE"], 5);
        let hub = EventHub::new();
        let mut rx = hub.subscribe(harness.run.id);
        let emitter = RunEmitter::new(harness.run.id, Some(hub.channel(harness.run.id)), None);

        let mut step_loop = StepLoop::new(harness.context());
        EventBus::scope(emitter, step_loop.run()).await.unwrap();

        let mut completed = Vec::new();
        while let Ok(RunEvent { name, payload, .. }) = rx.try_recv() {
            if name == STEP_COMPLETED {
                completed.push(payload["step_index"].as_u64().unwrap());
            }
        }
        assert_eq!(completed, vec![1, 2]);
    }

    #[test]
    fn test_click_detection() {
        assert!(is_click("click(10,20)"));
        assert!(is_click("pyautogui.doubleClick(1, 2)"));
        assert!(!is_click("type('hello')"));
    }
}
