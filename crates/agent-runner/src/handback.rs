//! Human handback
//!
//! Pausing writes a full replacement snapshot of every collaborator's state
//! and parks the run in `attention`. Resuming is split in three so the
//! controller can put the gate, the emitter and the step loop in between:
//! [`HandbackManager::claim_resume`] checks every precondition and moves the
//! run out of `attention` as its first durable side effect,
//! [`HandbackManager::reconcile`] asks the inference service what the human
//! changed and splices the answer into the conversation, and
//! [`HandbackManager::complete`] records the post-resume result.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use cua_core::event::{HANDBACK_INFERENCE, HANDBACK_REQUIRED, HANDBACK_RESUMED};
use cua_core::run::{
    ChatMessage, CompletionReason, ResultStatus, Run, RunResult, RunStatus, WorkItemStatus,
    HUMAN_HANDBACK_MESSAGE,
};
use cua_core::snapshot::{HandbackSnapshot, RunnerState};

use crate::bus::emit;
use crate::collaborators::{encode_screenshot, Collaborators, ComponentState, InferenceResult};
use crate::error::{ResumeRejection, Result, RunnerError};
use crate::persistence::RunStore;

const SUMMARY_MAX_CHARS: usize = 200;

/// Short human-readable summary shown while a run waits for a human
pub fn attention_summary(request: &str) -> String {
    let request = request.trim();
    if request.chars().count() > SUMMARY_MAX_CHARS {
        let cut = request.chars().take(SUMMARY_MAX_CHARS).collect::<String>();
        format!("Human attention required: {}...", cut)
    } else {
        format!("Human attention required: {}", request)
    }
}

/// A resume that passed every precondition and now owns the run
#[derive(Debug, Clone)]
pub struct ClaimedResume {
    /// Run record as it was after the claim
    pub run: Run,
    pub snapshot: HandbackSnapshot,
    /// Runner state decoded from the snapshot, spliced by `reconcile`
    pub state: RunnerState,
}

impl ClaimedResume {
    /// Description of the work item the paused loop was executing
    pub fn description(&self) -> String {
        self.state
            .work_item_id
            .and_then(|id| self.run.plan.iter().find(|item| item.id == id))
            .map(|item| item.description.clone())
            .unwrap_or_else(|| self.run.config.task.clone())
    }
}

#[derive(Debug, Clone)]
pub struct HandbackManager {
    store: RunStore,
}

impl HandbackManager {
    pub fn new(store: RunStore) -> Self {
        Self { store }
    }

    /// Persist a full snapshot and park the run in `attention`.
    ///
    /// `state` must already carry the handback step, the request and the
    /// handback screenshot. Store failures are logged; the returned result
    /// is the paused run's partial result either way.
    pub async fn pause(
        &self,
        run_id: Uuid,
        task: &str,
        mut state: RunnerState,
        components: &[Arc<dyn ComponentState>],
    ) -> RunResult {
        let result = RunResult::new(
            task,
            ResultStatus::Attention,
            CompletionReason::AwaitingHuman,
            state.steps.clone(),
        )
        .with_handback_notes(&state.messages);
        state.trajectory = result.trajectory.clone();
        let step_index = state.next_step_index.saturating_sub(1);

        let components = self.collect_components(run_id, components).await;
        match HandbackSnapshot::new(run_id, step_index, &state, components) {
            Ok(snapshot) => {
                if let Err(e) = self.store.save_snapshot(&snapshot) {
                    warn!("Failed to save handback snapshot for run {}: {}", run_id, e);
                }
            }
            Err(e) => warn!("Failed to build handback snapshot for run {}: {}", run_id, e),
        }

        if let Err(e) = self.store.save_result(run_id, &result) {
            warn!("Failed to save paused result for run {}: {}", run_id, e);
        }

        let summary = attention_summary(&state.request);
        let updated = self.store.update_run(run_id, |run| {
            run.merge_result(state.work_item_id, task, &result);
            run.mark_attention(summary.clone());
        });
        if let Err(e) = updated {
            warn!("Failed to mark run {} as needing attention: {}", run_id, e);
        }

        info!("Run {} paused for human at step {}: {}", run_id, step_index, state.request);
        emit(
            HANDBACK_REQUIRED,
            json!({
                "request": state.request,
                "step_index": step_index,
                "summary": summary,
            }),
        )
        .await;

        result
    }

    /// Previously stored component states overlaid with the live ones.
    ///
    /// State owned by a collaborator this run does not know about survives
    /// from the stored snapshot; the runner's own entry is rebuilt by the
    /// caller.
    async fn collect_components(
        &self,
        run_id: Uuid,
        components: &[Arc<dyn ComponentState>],
    ) -> BTreeMap<String, serde_json::Value> {
        let mut states = match self.store.load_snapshot(run_id) {
            Ok(Some(previous)) => previous.other_components(),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("Ignoring unreadable snapshot for run {}: {}", run_id, e);
                BTreeMap::new()
            }
        };

        for component in components {
            match component.export_state().await {
                Ok(state) => {
                    states.insert(component.component_name().to_string(), state);
                }
                Err(e) => warn!(
                    "Failed to export state of component {} for run {}: {}",
                    component.component_name(),
                    run_id,
                    e
                ),
            }
        }
        states
    }

    /// Check resume preconditions and claim the run.
    ///
    /// Nothing is written unless every check passes; the `attention` to
    /// `running` transition is the first durable side effect, so of two
    /// concurrent callers only one gets past it.
    pub fn claim_resume(&self, run_id: Uuid, tenant_id: Option<&str>) -> Result<ClaimedResume> {
        let run = self
            .store
            .find_run(run_id)?
            .ok_or_else(|| RunnerError::rejected(run_id, ResumeRejection::RunNotFound))?;

        if let Some(owner) = run.tenant_id.as_deref() {
            if tenant_id != Some(owner) {
                return Err(RunnerError::rejected(run_id, ResumeRejection::NotAuthorized));
            }
        }

        if run.status != RunStatus::Attention {
            return Err(RunnerError::rejected(run_id, ResumeRejection::NotInAttention));
        }

        let snapshot = match self.store.load_snapshot(run_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                return Err(RunnerError::rejected(run_id, ResumeRejection::MissingSnapshot))
            }
            Err(e) => {
                warn!("Handback snapshot for run {} is unreadable: {}", run_id, e);
                return Err(RunnerError::rejected(run_id, ResumeRejection::CorruptSnapshot));
            }
        };
        let state = snapshot.runner_state().map_err(|e| {
            warn!("Handback snapshot for run {} has no runner state: {}", run_id, e);
            RunnerError::rejected(run_id, ResumeRejection::CorruptSnapshot)
        })?;

        let run = self
            .store
            .transition_status(run_id, RunStatus::Attention, RunStatus::Running)?
            .ok_or_else(|| RunnerError::rejected(run_id, ResumeRejection::NotInAttention))?;

        info!("Resume claimed for run {}", run_id);
        Ok(ClaimedResume {
            run,
            snapshot,
            state,
        })
    }

    /// Put a claimed run back into `attention` after a failure that
    /// happened before the step loop restarted
    pub fn release_claim(&self, run_id: Uuid) {
        match self
            .store
            .transition_status(run_id, RunStatus::Running, RunStatus::Attention)
        {
            Ok(Some(_)) => info!("Run {} returned to attention", run_id),
            Ok(None) => warn!("Run {} left running state before its claim was released", run_id),
            Err(e) => warn!("Failed to release resume claim for run {}: {}", run_id, e),
        }
    }

    /// Restore collaborator state, ask what the human changed and splice
    /// the answer into the saved conversation.
    ///
    /// Returns the inference and the fresh screenshot, which becomes the
    /// resumed loop's baseline.
    pub async fn reconcile(
        &self,
        claim: &mut ClaimedResume,
        collaborators: &Collaborators,
    ) -> Result<(InferenceResult, Vec<u8>)> {
        for (name, state) in claim.snapshot.other_components() {
            match collaborators.component(&name) {
                Some(component) => component.import_state(state).await?,
                None => info!(
                    "Keeping state of component {} for run {} untouched",
                    name, claim.run.id
                ),
            }
        }

        let fresh = collaborators.vm.capture_screenshot().await?;
        let inference = collaborators
            .inference
            .infer(
                &claim.state.request,
                &claim.state.screenshot_b64,
                &encode_screenshot(&fresh),
            )
            .await?;

        emit(HANDBACK_INFERENCE, serde_json::to_value(&inference)?).await;

        let turn = inference.to_turn(&claim.state.request);
        let handback_step = claim.state.next_step_index.saturating_sub(1);
        claim.state.trajectory.push_str(&format!("\n#### Human handback\n{}\n", turn));
        claim.state.messages.push(
            ChatMessage::user(turn)
                .with_type(HUMAN_HANDBACK_MESSAGE)
                .at_step(handback_step),
        );

        Ok((inference, fresh))
    }

    /// Record the post-resume result and hand the run back to run-claiming.
    ///
    /// When the resumed loop paused again, `pause` has already replaced the
    /// snapshot and parked the run; only the resumed event is emitted.
    pub async fn complete(
        &self,
        claim: &ClaimedResume,
        result: &RunResult,
        state: RunnerState,
        inference: &InferenceResult,
    ) -> Result<Run> {
        let run_id = claim.run.id;

        let run = if result.is_attention() {
            self.store.load_run(run_id)?
        } else {
            match claim.snapshot.clone().with_runner_state(&state) {
                Ok(snapshot) => {
                    if let Err(e) = self.store.save_snapshot(&snapshot) {
                        warn!("Failed to update snapshot for run {}: {}", run_id, e);
                    }
                }
                Err(e) => warn!("Failed to update snapshot for run {}: {}", run_id, e),
            }
            if let Err(e) = self.store.save_result(run_id, result) {
                warn!("Failed to save resumed result for run {}: {}", run_id, e);
            }

            let description = claim.description();
            self.store.update_run(run_id, |run| {
                let item_id = run.merge_result(state.work_item_id, &description, result);
                if result.completion_reason == CompletionReason::CleanExit {
                    if let Some(item) = run.item_mut(item_id) {
                        item.status = WorkItemStatus::Interrupted;
                    }
                }
                if run.status == RunStatus::Running {
                    run.status = RunStatus::Queued;
                }
            })?
        };

        emit(
            HANDBACK_RESUMED,
            json!({
                "request": claim.state.request,
                "request_fulfilled": inference.request_fulfilled,
                "confidence": inference.confidence.as_str(),
                "status": result.status.as_str(),
                "completion_reason": result.completion_reason.as_str(),
                "paused_at": claim.state.paused_at,
                "resumed_at": Utc::now(),
            }),
        )
        .await;

        Ok(run)
    }
}
