//! Run results and trajectory rendering

use serde::{Deserialize, Serialize};

use super::model::{ChatMessage, HUMAN_HANDBACK_MESSAGE};
use super::step::StepRecord;

/// Terminal status of a step-loop execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    InProgress,
    Success,
    Failed,
    Attention,
    Timeout,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Attention => "attention",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// Why the step loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Predictor returned DONE
    Done,
    /// Predictor returned FAIL
    Fail,
    /// Agent handed back to a human and the run is paused
    AwaitingHuman,
    /// Step budget exhausted
    MaxSteps,
    /// Operator requested exit; partial result kept
    CleanExit,
    /// Unexpected failure inside the loop
    Error,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Fail => "fail",
            Self::AwaitingHuman => "awaiting_human",
            Self::MaxSteps => "max_steps",
            Self::CleanExit => "clean_exit",
            Self::Error => "error",
        }
    }
}

/// Result of one step-loop execution, produced once at loop exit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub task: String,
    pub status: ResultStatus,
    pub completion_reason: CompletionReason,
    pub steps: Vec<StepRecord>,
    /// Human-readable transcript of every step plus a final-status section
    pub trajectory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    /// Build a result and render its trajectory
    pub fn new(
        task: impl Into<String>,
        status: ResultStatus,
        completion_reason: CompletionReason,
        steps: Vec<StepRecord>,
    ) -> Self {
        let task = task.into();
        let trajectory = render_trajectory(&task, &steps, status, completion_reason, None);
        Self {
            task,
            status,
            completion_reason,
            steps,
            trajectory,
            error: None,
        }
    }

    /// Build an `error` result that still carries the steps produced so far
    pub fn errored(task: impl Into<String>, steps: Vec<StepRecord>, error: impl Into<String>) -> Self {
        let task = task.into();
        let error = error.into();
        let trajectory = render_trajectory(
            &task,
            &steps,
            ResultStatus::Error,
            CompletionReason::Error,
            Some(&error),
        );
        Self {
            task,
            status: ResultStatus::Error,
            completion_reason: CompletionReason::Error,
            steps,
            trajectory,
            error: Some(error),
        }
    }

    /// Re-render the trajectory with human handback turns placed after the
    /// step they follow
    pub fn with_handback_notes(mut self, messages: &[ChatMessage]) -> Self {
        let notes = messages
            .iter()
            .filter(|m| m.message_type.as_deref() == Some(HUMAN_HANDBACK_MESSAGE))
            .collect::<Vec<_>>();
        if notes.is_empty() {
            return self;
        }
        self.trajectory = render(
            &self.task,
            &self.steps,
            &notes,
            self.status,
            self.completion_reason,
            self.error.as_deref(),
        );
        self
    }

    pub fn is_attention(&self) -> bool {
        self.status == ResultStatus::Attention
    }

    pub fn last_step_index(&self) -> u32 {
        self.steps.last().map(|s| s.step_index).unwrap_or(0)
    }
}

/// Concatenate all steps and append a final-status section
pub fn render_trajectory(
    task: &str,
    steps: &[StepRecord],
    status: ResultStatus,
    reason: CompletionReason,
    error: Option<&str>,
) -> String {
    render(task, steps, &[], status, reason, error)
}

fn render(
    task: &str,
    steps: &[StepRecord],
    notes: &[&ChatMessage],
    status: ResultStatus,
    reason: CompletionReason,
    error: Option<&str>,
) -> String {
    let mut out = format!("## Task\n{}\n\n", task);
    for step in steps {
        out.push_str(&step.render());
        for note in notes.iter().filter(|n| n.step_index == Some(step.step_index)) {
            out.push_str(&format!("#### Human handback\n{}\n", note.content));
        }
        out.push('\n');
    }
    out.push_str("## Final status\n");
    out.push_str(&format!("Status: {}\n", status.as_str()));
    out.push_str(&format!("Completion reason: {}\n", reason.as_str()));
    out.push_str(&format!("Steps taken: {}\n", steps.len()));
    if let Some(error) = error {
        out.push_str(&format!("Error: {}\n", error));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trajectory_contains_every_step_and_final_status() {
        let steps = vec![
            StepRecord::new(1, "wait for load", "WAIT"),
            StepRecord::new(2, "finished", "DONE"),
        ];
        let result = RunResult::new("open settings", ResultStatus::Success, CompletionReason::Done, steps);

        assert!(result.trajectory.contains("### Step 1"));
        assert!(result.trajectory.contains("### Step 2"));
        assert!(result.trajectory.contains("Status: success"));
        assert!(result.trajectory.contains("Completion reason: done"));
        assert_eq!(result.last_step_index(), 2);
    }

    #[test]
    fn test_errored_result_keeps_steps() {
        let steps = vec![StepRecord::new(1, "", "click(1,1)")];
        let result = RunResult::errored("task", steps, "predictor unreachable");

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.steps.len(), 1);
        assert!(result.trajectory.contains("Error: predictor unreachable"));
    }

    #[test]
    fn test_handback_notes_follow_their_step() {
        let steps = vec![
            StepRecord::new(1, "", "HANDBACK_TO_USER: please sign in"),
            StepRecord::new(2, "", "DONE"),
        ];
        let note = ChatMessage::user("Request fulfilled: yes".to_string())
            .with_type(HUMAN_HANDBACK_MESSAGE)
            .at_step(1);
        let result = RunResult::new("t", ResultStatus::Success, CompletionReason::Done, steps)
            .with_handback_notes(&[ChatMessage::assistant("ignored".to_string()), note]);

        let handback = result.trajectory.find("#### Human handback").unwrap();
        assert!(result.trajectory.find("### Step 1").unwrap() < handback);
        assert!(handback < result.trajectory.find("### Step 2").unwrap());
        assert!(!result.trajectory.contains("ignored"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ResultStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let json = serde_json::to_string(&CompletionReason::AwaitingHuman).unwrap();
        assert_eq!(json, "\"awaiting_human\"");
    }
}
