pub mod config;
pub mod model;
pub mod result;
pub mod step;

pub use config::RunConfig;
pub use model::{
    ChatMessage, HUMAN_HANDBACK_MESSAGE, MessageRole, Run, RunStatus, RunSummary, WorkItem, WorkItemStatus,
};
pub use result::{render_trajectory, CompletionReason, ResultStatus, RunResult};
pub use step::{ActionKind, StepRecord};
