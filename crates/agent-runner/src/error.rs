//! Error types for agent-runner

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Why a resume call was rejected. No state is mutated when one of these is
/// returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeRejection {
    RunNotFound,
    NotAuthorized,
    NotInAttention,
    MissingSnapshot,
    CorruptSnapshot,
}

impl ResumeRejection {
    /// Stable reason code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::RunNotFound => "run_not_found",
            Self::NotAuthorized => "not_authorized",
            Self::NotInAttention => "not_in_attention",
            Self::MissingSnapshot => "missing_snapshot",
            Self::CorruptSnapshot => "corrupt_snapshot",
        }
    }
}

impl std::fmt::Display for ResumeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::RunNotFound => "run not found",
            Self::NotAuthorized => "not authorized",
            Self::NotInAttention => "run not in attention status",
            Self::MissingSnapshot => "no handback snapshot stored for run",
            Self::CorruptSnapshot => "handback snapshot could not be decoded",
        };
        f.write_str(message)
    }
}

/// Errors that can occur while running or resuming a task
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Predictor call failed
    #[error("Predictor error: {message}")]
    Predictor { message: String },

    /// Remote desktop call failed
    #[error("VM session error: {message}")]
    VmSession { message: String },

    /// Human inference call failed
    #[error("Human inference error: {message}")]
    Inference { message: String },

    /// Run not found
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: Uuid },

    /// Resume precondition violated
    #[error("Resume rejected for run {run_id}: {reason}")]
    ResumeRejected { run_id: Uuid, reason: ResumeRejection },

    /// Concurrency gate closed
    #[error("Concurrency gate closed")]
    GateClosed,

    /// Storage error
    #[error("Storage error: {0}")]
    Store(#[from] cua_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Run setup failed
    #[error("Run setup failed: {message}")]
    Setup { message: String },
}

impl RunnerError {
    pub fn predictor(message: impl Into<String>) -> Self {
        Self::Predictor {
            message: message.into(),
        }
    }

    pub fn vm(message: impl Into<String>) -> Self {
        Self::VmSession {
            message: message.into(),
        }
    }

    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
        }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }

    pub fn rejected(run_id: Uuid, reason: ResumeRejection) -> Self {
        Self::ResumeRejected { run_id, reason }
    }

    /// The rejection reason, if this error is a resume rejection
    pub fn rejection(&self) -> Option<ResumeRejection> {
        match self {
            Self::ResumeRejected { reason, .. } => Some(*reason),
            Self::RunNotFound { .. } => Some(ResumeRejection::RunNotFound),
            _ => None,
        }
    }
}
