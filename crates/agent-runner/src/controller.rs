//! Run orchestration
//!
//! The controller owns the process-wide services (store, gate, signal, live
//! hub) and is the single place where an error escaping the step loop turns
//! into an `errored` run. Every exit path of a run task releases its gate
//! slot, stops its keepalive and ends its live stream. Run tasks are tracked
//! so shutdown can wait for them to reach their clean-exit path.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use cua_core::event::{RUN_COMPLETED, RUN_ERROR, RUN_EXITED, RUN_STARTED, STREAM_END};
use cua_core::run::{CompletionReason, Run, RunResult, RunStatus, WorkItemStatus};

use crate::bus::{emit, EventBus, EventHub, EventSink, RunEmitter, DEFAULT_KEEPALIVE_INTERVAL};
use crate::cancel::CancellationSignal;
use crate::collaborators::{CollaboratorFactory, Collaborators, InferenceResult};
use crate::error::{Result, RunnerError};
use crate::gate::{ConcurrencyGate, GateConfig};
use crate::handback::{ClaimedResume, HandbackManager};
use crate::persistence::RunStore;
use crate::step_loop::{LoopContext, StepLoop, DEFAULT_WAIT_INTERVAL};

const RECOVER_PAGE_SIZE: usize = 100;

pub const DEFAULT_VM_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Process-level runner settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub gate: GateConfig,
    pub keepalive_interval: Duration,
    /// Sleep for `WAIT` and empty actions
    pub wait_interval: Duration,
    /// How long a run waits for its VM session to report healthy
    pub vm_ready_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            wait_interval: DEFAULT_WAIT_INTERVAL,
            vm_ready_timeout: DEFAULT_VM_READY_TIMEOUT,
        }
    }
}

/// What a successful resume call returns
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOutcome {
    pub run_id: Uuid,
    pub request: String,
    pub inference: InferenceResult,
    pub result: RunResult,
    pub status: RunStatus,
}

/// How a single work item's loop ended
enum ItemOutcome {
    Finished,
    Paused,
    Exited,
    Errored(String),
}

#[derive(Clone)]
pub struct RunController {
    store: RunStore,
    gate: Arc<ConcurrencyGate>,
    signal: Arc<CancellationSignal>,
    hub: Arc<EventHub>,
    factory: Arc<dyn CollaboratorFactory>,
    handback: HandbackManager,
    tasks: TaskTracker,
    config: RunnerConfig,
}

impl RunController {
    pub fn new(
        store: RunStore,
        factory: Arc<dyn CollaboratorFactory>,
        signal: Arc<CancellationSignal>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            handback: HandbackManager::new(store.clone()),
            gate: Arc::new(ConcurrencyGate::new(config.gate)),
            hub: Arc::new(EventHub::new()),
            tasks: TaskTracker::new(),
            store,
            signal,
            factory,
            config,
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn signal(&self) -> &Arc<CancellationSignal> {
        &self.signal
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn emitter(&self, run_id: Uuid) -> RunEmitter {
        let durable: Arc<dyn EventSink> = Arc::new(self.store.clone());
        RunEmitter::new(run_id, Some(self.hub.channel(run_id)), Some(durable))
    }

    /// Persist a new queued run and dispatch it
    pub fn submit(&self, run: Run) -> Result<Uuid> {
        self.store.save_run(&run)?;
        info!("Submitted run {} ({} work items)", run.id, run.plan.len());
        self.dispatch(run.id);
        Ok(run.id)
    }

    /// Execute a queued run on its own task
    pub fn dispatch(&self, run_id: Uuid) -> JoinHandle<()> {
        let controller = self.clone();
        self.tasks.spawn(async move {
            if let Err(e) = controller.execute(run_id).await {
                error!("Run {} failed outside the step loop: {}", run_id, e);
            }
        })
    }

    /// Claim and execute a queued run.
    ///
    /// Returns `None` when the run was not `queued` by the time the gate
    /// let it through, i.e. someone else claimed it.
    pub async fn execute(&self, run_id: Uuid) -> Result<Option<RunStatus>> {
        let run = self.store.load_run(run_id)?;
        let _slot = self.gate.acquire(run.tenant_id.as_deref()).await?;

        let Some(run) = self
            .store
            .transition_status(run_id, RunStatus::Queued, RunStatus::Running)?
        else {
            info!("Run {} was already claimed", run_id);
            return Ok(None);
        };

        let emitter = self.emitter(run_id);
        let _keepalive = emitter.spawn_keepalive(self.config.keepalive_interval);
        let status = EventBus::scope(emitter, self.execute_claimed(run)).await;

        self.end_stream(run_id).await;
        status.map(Some)
    }

    async fn execute_claimed(&self, run: Run) -> Result<RunStatus> {
        let run_id = run.id;
        emit(
            RUN_STARTED,
            json!({
                "task": run.config.task,
                "tenant_id": run.tenant_id,
                "max_steps": run.config.max_steps,
                "work_items": run.plan.len(),
            }),
        )
        .await;

        let collaborators = match self.factory.build(&run) {
            Ok(collaborators) => collaborators,
            Err(e) => return self.fail_run(run_id, e.to_string()).await,
        };
        if let Err(e) = self.prepare_session(run_id, &collaborators).await {
            return self.fail_run(run_id, e.to_string()).await;
        }

        while let Some(item) = self.store.load_run(run_id)?.next_pending_item().cloned() {
            let run = self.store.update_run(run_id, |run| {
                if let Some(entry) = run.item_mut(item.id) {
                    entry.status = WorkItemStatus::Running;
                }
            })?;

            let ctx = LoopContext {
                run_id,
                work_item_id: Some(item.id),
                task: item.description.clone(),
                config: run.config.clone(),
                collaborators: collaborators.clone(),
                signal: Arc::clone(&self.signal),
                handback: self.handback.clone(),
                wait_interval: self.config.wait_interval,
            };
            let mut step_loop = StepLoop::new(ctx);
            let outcome = match step_loop.run().await {
                Ok(result) => self.record_item(run_id, item.id, &item.description, &result),
                Err(e) => {
                    let result = step_loop.errored(e.to_string());
                    self.record_item(run_id, item.id, &item.description, &result);
                    ItemOutcome::Errored(e.to_string())
                }
            };

            match outcome {
                ItemOutcome::Finished => continue,
                ItemOutcome::Paused => return Ok(RunStatus::Attention),
                ItemOutcome::Exited => return self.exit_run(run_id).await,
                ItemOutcome::Errored(message) => return self.fail_run(run_id, message).await,
            }
        }

        self.finalize(run_id).await
    }

    async fn prepare_session(&self, run_id: Uuid, collaborators: &Collaborators) -> Result<()> {
        let vm = &collaborators.vm;
        vm.wait_for_health(self.config.vm_ready_timeout).await?;
        let (width, height) = vm.screen_size().await?;
        let platform = vm.platform().await?;
        info!(
            "Run {} attached to {} desktop ({}x{})",
            run_id, platform, width, height
        );
        Ok(())
    }

    /// Store a work item's result. A paused result was already recorded by
    /// the handback manager.
    fn record_item(&self, run_id: Uuid, item_id: Uuid, description: &str, result: &RunResult) -> ItemOutcome {
        if result.is_attention() {
            return ItemOutcome::Paused;
        }

        if let Err(e) = self.store.save_result(run_id, result) {
            warn!("Failed to save result for run {}: {}", run_id, e);
        }
        let merged = self.store.update_run(run_id, |run| {
            run.merge_result(Some(item_id), description, result);
        });
        if let Err(e) = merged {
            warn!("Failed to record work item result for run {}: {}", run_id, e);
        }

        match (result.completion_reason, &result.error) {
            (_, Some(error)) => ItemOutcome::Errored(error.clone()),
            (CompletionReason::CleanExit, _) => ItemOutcome::Exited,
            _ => ItemOutcome::Finished,
        }
    }

    /// Derive the terminal status from the plan once no item is pending
    async fn finalize(&self, run_id: Uuid) -> Result<RunStatus> {
        let run = self.store.update_run(run_id, |run| {
            let Some(status) = run.outcome_from_plan() else {
                run.mark_errored("work items left unfinished".to_string());
                return;
            };
            let succeeded = run
                .plan
                .iter()
                .filter(|item| item.status == WorkItemStatus::Succeeded)
                .count();
            let summary = format!("{} of {} work items succeeded", succeeded, run.plan.len());
            run.mark_ended(status, Some(summary));
        })?;

        let steps = run.plan.iter().map(|item| item.step_count).sum::<u32>();
        info!("Run {} completed: {}", run_id, run.status.as_str());
        emit(
            RUN_COMPLETED,
            json!({ "status": run.status.as_str(), "summary": run.summary, "steps": steps }),
        )
        .await;
        Ok(run.status)
    }

    async fn exit_run(&self, run_id: Uuid) -> Result<RunStatus> {
        self.store.update_run(run_id, |run| {
            run.mark_ended(RunStatus::Exited, Some("completed via clean exit".to_string()));
        })?;
        info!("Run {} completed via clean exit", run_id);
        emit(RUN_EXITED, json!({ "status": RunStatus::Exited.as_str() })).await;
        Ok(RunStatus::Exited)
    }

    async fn fail_run(&self, run_id: Uuid, message: String) -> Result<RunStatus> {
        error!("Run {} errored: {}", run_id, message);
        self.store.update_run(run_id, |run| run.mark_errored(message.clone()))?;
        emit(RUN_ERROR, json!({ "error": message })).await;
        Ok(RunStatus::Errored)
    }

    async fn end_stream(&self, run_id: Uuid) {
        self.emitter(run_id).emit(STREAM_END, json!({})).await;
        self.hub.close(run_id);
    }

    /// Stop accepting run tasks and wait for the dispatched ones to finish.
    ///
    /// Call after exit was requested: every run then unwinds at its next
    /// checkpoint and records its clean exit before this returns.
    pub async fn shutdown(&self) {
        self.tasks.close();
        info!("Waiting for {} run tasks to finish", self.tasks.len());
        self.tasks.wait().await;
    }

    /// Dispatch queued runs and error out runs a previous process left
    /// running. Returns the number of runs dispatched.
    pub fn recover(&self) -> Result<usize> {
        let mut queued = Vec::new();
        let mut stale = Vec::new();
        let mut offset = 0;
        loop {
            let (runs, has_more) = self.store.list_runs(offset, RECOVER_PAGE_SIZE, None, None)?;
            offset += runs.len();
            for run in runs {
                match run.status {
                    RunStatus::Queued => queued.push(run.id),
                    RunStatus::Running => stale.push(run.id),
                    _ => {}
                }
            }
            if !has_more {
                break;
            }
        }

        for run_id in stale {
            warn!("Run {} was running when the process stopped", run_id);
            self.store.update_run(run_id, |run| {
                run.mark_errored("interrupted by process restart".to_string());
            })?;
        }

        let dispatched = queued.len();
        for run_id in queued {
            self.dispatch(run_id);
        }
        info!("Recovered {} queued runs", dispatched);
        Ok(dispatched)
    }

    /// Resume a run paused for a human.
    ///
    /// Rejections leave the run untouched. Once claimed, the saved loop is
    /// reconciled with what the human did and re-run from its next step;
    /// afterwards the run goes back to `queued` and is dispatched so any
    /// remaining work items execute.
    pub async fn resume(&self, run_id: Uuid, tenant_id: Option<&str>) -> Result<ResumeOutcome> {
        let claim = self.handback.claim_resume(run_id, tenant_id)?;
        let emitter = self.emitter(run_id);
        let keepalive = emitter.spawn_keepalive(self.config.keepalive_interval);

        let outcome = EventBus::scope(emitter, self.resume_claimed(claim)).await;
        drop(keepalive);
        match &outcome {
            Ok(outcome) if outcome.status == RunStatus::Queued => {
                self.dispatch(run_id);
            }
            _ => self.end_stream(run_id).await,
        }
        outcome
    }

    async fn resume_claimed(&self, mut claim: ClaimedResume) -> Result<ResumeOutcome> {
        let run_id = claim.run.id;

        let collaborators = match self.factory.build(&claim.run) {
            Ok(collaborators) => collaborators,
            Err(e) => {
                self.handback.release_claim(run_id);
                return Err(e);
            }
        };
        let inference = match self.handback.reconcile(&mut claim, &collaborators).await {
            Ok(reconciled) => reconciled,
            Err(e) => {
                warn!("Reconciling run {} after handback failed: {}", run_id, e);
                self.handback.release_claim(run_id);
                return Err(e);
            }
        };
        let (inference, baseline) = inference;

        let _slot = match self.gate.acquire(claim.run.tenant_id.as_deref()).await {
            Ok(slot) => slot,
            Err(e) => {
                self.handback.release_claim(run_id);
                return Err(e);
            }
        };

        let mut step_loop = StepLoop::resume(
            self.loop_context(&claim, collaborators),
            claim.state.clone(),
            baseline,
        );
        let result = match step_loop.run().await {
            Ok(result) => result,
            Err(e) => {
                let result = step_loop.errored(e.to_string());
                self.record_failed_resume(&claim, &result, &e);
                self.fail_run(run_id, e.to_string()).await?;
                return Err(e);
            }
        };

        let state = step_loop.runner_state(
            claim.state.request.clone(),
            claim.state.screenshot_b64.clone(),
            result.trajectory.clone(),
        );
        let run = self.handback.complete(&claim, &result, state, &inference).await?;

        if result.completion_reason == CompletionReason::CleanExit {
            self.exit_run(run_id).await?;
            return Ok(ResumeOutcome {
                run_id,
                request: claim.state.request.clone(),
                inference,
                result,
                status: RunStatus::Exited,
            });
        }

        Ok(ResumeOutcome {
            run_id,
            request: claim.state.request.clone(),
            inference,
            result,
            status: run.status,
        })
    }

    fn loop_context(&self, claim: &ClaimedResume, collaborators: Collaborators) -> LoopContext {
        LoopContext {
            run_id: claim.run.id,
            work_item_id: claim.state.work_item_id,
            task: claim.description(),
            config: claim.run.config.clone(),
            collaborators,
            signal: Arc::clone(&self.signal),
            handback: self.handback.clone(),
            wait_interval: self.config.wait_interval,
        }
    }

    fn record_failed_resume(&self, claim: &ClaimedResume, result: &RunResult, err: &RunnerError) {
        let run_id = claim.run.id;
        if let Err(e) = self.store.save_result(run_id, result) {
            warn!("Failed to save result for run {}: {}", run_id, e);
        }
        let description = claim.description();
        let merged = self.store.update_run(run_id, |run| {
            run.merge_result(claim.state.work_item_id, &description, result);
        });
        if let Err(e) = merged {
            warn!("Failed to record resumed work item for run {} ({}): {}", run_id, err, e);
        }
    }
}
