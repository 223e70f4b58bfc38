//! Action classification
//!
//! Maps the predictor's raw action string onto the closed set of things the
//! step loop knows how to do.

/// Prefix that marks an action as a request for human help
pub const HANDBACK_MARKER: &str = "HANDBACK_TO_USER:";

/// Classified form of a predicted action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Done,
    Fail,
    /// Pause the run and ask a human to act
    Handback(String),
    Wait,
    /// Send the payload to the remote desktop
    Execute(String),
    Noop,
}

impl Action {
    /// Whether the step loop stops after recording this action
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Fail | Self::Handback(_))
    }
}

/// Classify a raw action string.
///
/// Exact DONE/FAIL checks run before the prefix checks, and the handback
/// marker is checked before the generic non-empty fallback. Only DONE is
/// matched case-insensitively.
pub fn classify(raw: &str) -> Action {
    let action = raw.trim();

    if action.eq_ignore_ascii_case(ControlAction::Done.keyword()) {
        return Action::Done;
    }
    if action == ControlAction::Fail.keyword() {
        return Action::Fail;
    }
    if let Some(request) = action.strip_prefix(HANDBACK_MARKER) {
        return Action::Handback(request.trim().to_string());
    }
    if action.starts_with(ControlAction::Wait.keyword()) {
        return Action::Wait;
    }
    if !action.is_empty() {
        return Action::Execute(action.to_string());
    }
    Action::Noop
}

/// Control actions the predictor may emit besides regular GUI code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Done,
    Fail,
    Wait,
    Handback,
}

impl ControlAction {
    /// Every control action, in the order they are described to the predictor
    pub const ALL: [ControlAction; 4] = [Self::Done, Self::Fail, Self::Wait, Self::Handback];

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Done => "DONE",
            Self::Fail => "FAIL",
            Self::Wait => "WAIT",
            Self::Handback => HANDBACK_MARKER,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Done => "The task is complete.",
            Self::Fail => "The task cannot be completed.",
            Self::Wait => "Nothing to do yet; wait for the screen to change.",
            Self::Handback => {
                "A human must act (credentials, confirmation, CAPTCHA). Follow the marker with the request."
            }
        }
    }

    /// Render the control vocabulary as one line per action
    pub fn vocabulary() -> String {
        Self::ALL
            .iter()
            .map(|action| format!("- {}: {}", action.keyword(), action.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
