//! Agent Runner - resumable step execution for desktop automation agents
//!
//! This crate drives an agent through observe / predict / execute steps
//! against a remote desktop, pauses runs for a human when the agent asks for
//! one, and resumes them from a snapshot once the human is done. Runs are
//! bounded by a global and per-tenant concurrency gate, and every run
//! streams live events while a whitelisted subset is persisted for audit.

mod bus;
mod cancel;
mod classify;
mod collaborators;
mod controller;
mod error;
mod gate;
mod handback;
mod http;
mod persistence;
mod step_loop;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bus::{emit, EventBus, EventHub, EventSink, KeepaliveGuard, RunEmitter, DEFAULT_KEEPALIVE_INTERVAL};
pub use cancel::{CancellationSignal, Checkpoint};
pub use classify::{classify, Action, ControlAction, HANDBACK_MARKER};
pub use collaborators::{
    decode_screenshot, encode_screenshot, AgentPredictor, BehaviorNarrator, CollaboratorFactory,
    Collaborators, ComponentState, Confidence, ExecutionResult, HumanInference, InferenceResult,
    Narration, Observation, Prediction, PredictionInfo, VmSession,
};
pub use controller::{ResumeOutcome, RunController, RunnerConfig, DEFAULT_VM_READY_TIMEOUT};
pub use error::{Result, ResumeRejection, RunnerError};
pub use gate::{ConcurrencyGate, ConcurrencySlot, GateConfig};
pub use handback::{attention_summary, ClaimedResume, HandbackManager};
pub use http::{
    HttpCollaboratorFactory, HttpEndpoints, HttpHumanInference, HttpNarrator, HttpPredictor,
    HttpVmSession, PREDICTOR_COMPONENT,
};
pub use persistence::RunStore;
pub use step_loop::{LoopContext, StepLoop, DEFAULT_WAIT_INTERVAL};
