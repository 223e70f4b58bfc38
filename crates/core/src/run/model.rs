//! Run - Persistent execution record
//!
//! A Run is the externally visible record of one task: its status, its plan
//! of work items, and the outcome recorded for each item. The step loop's
//! in-flight state lives elsewhere; this is what operators and the resume
//! call read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::RunConfig;
use super::result::{CompletionReason, ResultStatus, RunResult};

/// Message type of the synthetic turn spliced in when a run resumes
pub const HUMAN_HANDBACK_MESSAGE: &str = "human_handback";

/// Message role in the agent conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A turn in the conversation the predictor sees as prior context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message ID
    pub id: String,

    /// Role of the message sender
    pub role: MessageRole,

    /// Message content
    pub content: String,

    /// Timestamp in milliseconds
    pub timestamp: i64,

    /// Message type (observation, plan, human_handback, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,

    /// Step this message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
}

impl ChatMessage {
    fn build(role: MessageRole, content: String, message_type: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now().timestamp_millis(),
            message_type: Some(message_type.to_string()),
            step_index: None,
        }
    }

    /// Create a new user message
    pub fn user(content: String) -> Self {
        Self::build(MessageRole::User, content, "text")
    }

    /// Create a new assistant message
    pub fn assistant(content: String) -> Self {
        Self::build(MessageRole::Assistant, content, "text")
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn at_step(mut self, step_index: u32) -> Self {
        self.step_index = Some(step_index);
        self
    }
}

/// Externally visible status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed and executing
    Running,
    /// Paused for a human
    Attention,
    Succeeded,
    Failed,
    TimedOut,
    /// Crashed inside the loop
    Errored,
    /// Completed via clean exit
    Exited,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Errored | Self::Exited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Attention => "attention",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Errored => "errored",
            Self::Exited => "exited",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "attention" => Some(Self::Attention),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "errored" => Some(Self::Errored),
            "exited" => Some(Self::Exited),
            _ => None,
        }
    }
}

/// Status of a single planned piece of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Running,
    Attention,
    Succeeded,
    Failed,
    TimedOut,
    Errored,
    Interrupted,
}

impl WorkItemStatus {
    /// Whether the item still needs (more) execution
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Attention)
    }

    fn from_result(status: ResultStatus, reason: CompletionReason) -> Self {
        match (status, reason) {
            (ResultStatus::Success, _) => Self::Succeeded,
            (ResultStatus::Failed, _) => Self::Failed,
            (ResultStatus::Attention, _) => Self::Attention,
            (ResultStatus::Timeout, _) => Self::TimedOut,
            (ResultStatus::Error, _) => Self::Errored,
            (ResultStatus::InProgress, CompletionReason::CleanExit) => Self::Interrupted,
            (ResultStatus::InProgress, _) => Self::Running,
        }
    }
}

/// One entry of a run's plan and results history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub description: String,
    pub status: WorkItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<CompletionReason>,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            status: WorkItemStatus::Pending,
            completion_reason: None,
            step_count: 0,
            trajectory: None,
            updated_at: Utc::now(),
        }
    }

    fn apply(&mut self, result: &RunResult) {
        self.status = WorkItemStatus::from_result(result.status, result.completion_reason);
        self.completion_reason = Some(result.completion_reason);
        self.step_count = result.steps.len() as u32;
        self.trajectory = Some(result.trajectory.clone());
        self.updated_at = Utc::now();
    }
}

/// A persistent run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run ID
    pub id: Uuid,

    /// Tenant the run is bounded and authorized against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    pub config: RunConfig,

    pub status: RunStatus,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub ended_at: Option<DateTime<Utc>>,

    /// Human-readable summary (the handback request while in attention)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Error message (if errored)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Plan and results history
    #[serde(default)]
    pub plan: Vec<WorkItem>,
}

impl Run {
    /// Create a queued run with a single work item holding the task text
    pub fn new(config: RunConfig, tenant_id: Option<String>) -> Self {
        let plan = vec![WorkItem::new(config.task.clone())];
        Self::with_plan(config, tenant_id, plan)
    }

    /// Create a queued run with an explicit plan
    pub fn with_plan(config: RunConfig, tenant_id: Option<String>, plan: Vec<WorkItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            config,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            summary: None,
            error: None,
            plan,
        }
    }

    /// Mark the run as started
    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = RunStatus::Running;
    }

    /// Mark the run as waiting for a human
    pub fn mark_attention(&mut self, summary: String) {
        self.status = RunStatus::Attention;
        self.summary = Some(summary);
    }

    /// Mark the run as ended with the given terminal status
    pub fn mark_ended(&mut self, status: RunStatus, summary: Option<String>) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        if summary.is_some() {
            self.summary = summary;
        }
    }

    pub fn mark_errored(&mut self, error: String) {
        self.error = Some(error.clone());
        self.mark_ended(RunStatus::Errored, Some(error));
    }

    /// Check if the run is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Next work item that has not started yet
    pub fn next_pending_item(&self) -> Option<&WorkItem> {
        self.plan
            .iter()
            .find(|item| item.status == WorkItemStatus::Pending)
    }

    pub fn item_mut(&mut self, id: Uuid) -> Option<&mut WorkItem> {
        self.plan.iter_mut().find(|item| item.id == id)
    }

    /// Merge a step-loop result into the plan history.
    ///
    /// The result is matched by work item id first, then by description
    /// among items that have not finished, and updated in place. Only when
    /// neither matches is a new item appended. Returns the id of the item
    /// that now holds the result.
    pub fn merge_result(&mut self, item_id: Option<Uuid>, description: &str, result: &RunResult) -> Uuid {
        if let Some(item) = item_id.and_then(|id| self.item_mut(id)) {
            item.apply(result);
            return item.id;
        }

        if let Some(item) = self
            .plan
            .iter_mut()
            .find(|item| item.status.is_open() && item.description == description)
        {
            item.apply(result);
            return item.id;
        }

        let mut item = WorkItem::new(description);
        item.apply(result);
        let id = item.id;
        self.plan.push(item);
        id
    }

    /// Terminal status derived from the plan once no item is open.
    ///
    /// Returns `None` while work remains.
    pub fn outcome_from_plan(&self) -> Option<RunStatus> {
        if self.plan.iter().any(|item| item.status.is_open()) {
            return None;
        }
        let first_unsuccessful = self
            .plan
            .iter()
            .find(|item| item.status != WorkItemStatus::Succeeded);
        Some(match first_unsuccessful.map(|item| item.status) {
            None => RunStatus::Succeeded,
            Some(WorkItemStatus::Failed) => RunStatus::Failed,
            Some(WorkItemStatus::TimedOut) => RunStatus::TimedOut,
            Some(WorkItemStatus::Interrupted) => RunStatus::Exited,
            Some(_) => RunStatus::Errored,
        })
    }
}

/// Summary of a run for listing purposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    /// Truncated task (first 100 chars)
    pub task_preview: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        let task_preview = if run.config.task.chars().count() > 100 {
            format!("{}...", run.config.task.chars().take(100).collect::<String>())
        } else {
            run.config.task.clone()
        };

        Self {
            id: run.id,
            tenant_id: run.tenant_id.clone(),
            task_preview,
            status: run.status,
            created_at: run.created_at,
            ended_at: run.ended_at,
            summary: run.summary.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::step::StepRecord;

    fn result(status: ResultStatus, reason: CompletionReason) -> RunResult {
        RunResult::new("task", status, reason, vec![StepRecord::new(1, "", "DONE")])
    }

    #[test]
    fn test_run_creation() {
        let run = Run::new(RunConfig::new("Book a flight"), Some("tenant-a".to_string()));

        assert!(!run.id.is_nil());
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.plan.len(), 1);
        assert_eq!(run.plan[0].description, "Book a flight");
        assert!(run.started_at.is_none());
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::new(RunConfig::new("Test"), None);

        run.mark_started();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        run.mark_attention("please sign in".to_string());
        assert_eq!(run.status, RunStatus::Attention);
        assert!(!run.is_terminal());

        run.mark_ended(RunStatus::Succeeded, None);
        assert!(run.is_terminal());
        assert_eq!(run.summary.as_deref(), Some("please sign in"));
    }

    #[test]
    fn test_merge_updates_matching_item_in_place() {
        let mut run = Run::new(RunConfig::new("Send the report"), None);
        let item_id = run.plan[0].id;

        let merged = run.merge_result(Some(item_id), "Send the report", &result(ResultStatus::Success, CompletionReason::Done));

        assert_eq!(merged, item_id);
        assert_eq!(run.plan.len(), 1);
        assert_eq!(run.plan[0].status, WorkItemStatus::Succeeded);
        assert_eq!(run.plan[0].step_count, 1);
    }

    #[test]
    fn test_merge_falls_back_to_open_item_description() {
        let mut run = Run::with_plan(
            RunConfig::new("two things"),
            None,
            vec![WorkItem::new("log in"), WorkItem::new("download invoice")],
        );

        run.merge_result(Some(Uuid::new_v4()), "download invoice", &result(ResultStatus::Failed, CompletionReason::Fail));

        assert_eq!(run.plan.len(), 2);
        assert_eq!(run.plan[0].status, WorkItemStatus::Pending);
        assert_eq!(run.plan[1].status, WorkItemStatus::Failed);
    }

    #[test]
    fn test_merge_appends_when_nothing_matches() {
        let mut run = Run::new(RunConfig::new("first"), None);
        run.plan[0].status = WorkItemStatus::Succeeded;

        run.merge_result(None, "first", &result(ResultStatus::Success, CompletionReason::Done));

        assert_eq!(run.plan.len(), 2);
    }

    #[test]
    fn test_outcome_from_plan() {
        let mut run = Run::with_plan(
            RunConfig::new("t"),
            None,
            vec![WorkItem::new("a"), WorkItem::new("b")],
        );
        assert_eq!(run.outcome_from_plan(), None);

        run.plan[0].status = WorkItemStatus::Succeeded;
        run.plan[1].status = WorkItemStatus::TimedOut;
        assert_eq!(run.outcome_from_plan(), Some(RunStatus::TimedOut));

        run.plan[1].status = WorkItemStatus::Succeeded;
        assert_eq!(run.outcome_from_plan(), Some(RunStatus::Succeeded));
    }

    #[test]
    fn test_run_summary_truncates_task() {
        let run = Run::new(RunConfig::new("x".repeat(150)), None);
        let summary = RunSummary::from(&run);
        assert_eq!(summary.task_preview.len(), 103);
    }

    #[test]
    fn test_status_parse_round_trips_labels() {
        for status in [RunStatus::Queued, RunStatus::Attention, RunStatus::TimedOut, RunStatus::Exited] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("nope"), None);
    }
}
