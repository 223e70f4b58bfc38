//! Per-run configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable configuration for a single run.
///
/// Missing fields deserialize to their defaults so older run records and
/// partial API requests stay loadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Natural-language task handed to the predictor
    pub task: String,

    /// Step budget; reaching it without a terminal action is a timeout
    pub max_steps: u32,

    /// Delay between a remote action and the screenshot that follows it
    pub post_action_delay_ms: u64,

    /// Extra settle delay after pointer clicks before the baseline screenshot
    /// for the next step is taken. Zero disables the delayed recapture.
    pub click_settle_delay_ms: u64,

    /// Platform identifier of the target desktop (linux, windows, darwin)
    pub platform: String,

    /// Whether the predictor should produce reflection text
    pub enable_reflection: bool,

    /// Whether the predictor may emit raw code execution actions
    pub enable_code_execution: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            task: String::new(),
            max_steps: 15,
            post_action_delay_ms: 500,
            click_settle_delay_ms: 0,
            platform: "linux".to_string(),
            enable_reflection: true,
            enable_code_execution: false,
        }
    }
}

impl RunConfig {
    /// Create a config for a task with default settings
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_post_action_delay(mut self, delay: Duration) -> Self {
        self.post_action_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_click_settle_delay(mut self, delay: Duration) -> Self {
        self.click_settle_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn post_action_delay(&self) -> Duration {
        Duration::from_millis(self.post_action_delay_ms)
    }

    pub fn click_settle_delay(&self) -> Option<Duration> {
        (self.click_settle_delay_ms > 0).then(|| Duration::from_millis(self.click_settle_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RunConfig = serde_json::from_str(r#"{"task":"open the mail app"}"#).unwrap();

        assert_eq!(config.task, "open the mail app");
        assert_eq!(config.max_steps, 15);
        assert_eq!(config.platform, "linux");
        assert!(config.enable_reflection);
        assert!(!config.enable_code_execution);
    }

    #[test]
    fn test_click_settle_delay_disabled_by_default() {
        let config = RunConfig::new("task");
        assert!(config.click_settle_delay().is_none());

        let config = config.with_click_settle_delay(Duration::from_millis(750));
        assert_eq!(config.click_settle_delay(), Some(Duration::from_millis(750)));
    }
}
