//! Server configuration read from the environment

use std::path::PathBuf;
use std::time::Duration;

use agent_runner::{GateConfig, HttpEndpoints, RunnerConfig, DEFAULT_WAIT_INTERVAL};
use cua_core::run::RunConfig;
use serde::Serialize;

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => parse_flag(&raw).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// Feature flags applied to every new run's config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    pub reflection: bool,
    pub code_execution: bool,
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        Self {
            reflection: env_flag("FEATURE_REFLECTION", true),
            code_execution: env_flag("FEATURE_CODE_EXECUTION", false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub max_concurrent_runs: usize,
    pub max_runs_per_tenant: usize,
    pub keepalive_interval: Duration,
    pub vm_url: String,
    pub predictor_url: String,
    pub narrator_url: String,
    pub inference_url: String,
    pub http_timeout: Duration,
    pub features: FeatureFlags,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".cua-data"),
            bind_addr: "0.0.0.0:8081".to_string(),
            max_concurrent_runs: 0,
            max_runs_per_tenant: 0,
            keepalive_interval: Duration::from_secs(15),
            vm_url: "http://localhost:5000".to_string(),
            predictor_url: "http://localhost:9000".to_string(),
            narrator_url: "http://localhost:9001".to_string(),
            inference_url: "http://localhost:9002".to_string(),
            http_timeout: Duration::from_secs(120),
            features: FeatureFlags {
                reflection: true,
                code_execution: false,
            },
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("CUA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            bind_addr: env_string("CUA_BIND_ADDR", &defaults.bind_addr),
            max_concurrent_runs: env_number("CUA_MAX_CONCURRENT_RUNS", 0),
            max_runs_per_tenant: env_number("CUA_MAX_RUNS_PER_TENANT", 0),
            keepalive_interval: Duration::from_secs(env_number("CUA_KEEPALIVE_SECS", 15u64).max(1)),
            vm_url: env_string("CUA_VM_URL", &defaults.vm_url),
            predictor_url: env_string("CUA_PREDICTOR_URL", &defaults.predictor_url),
            narrator_url: env_string("CUA_NARRATOR_URL", &defaults.narrator_url),
            inference_url: env_string("CUA_INFERENCE_URL", &defaults.inference_url),
            http_timeout: Duration::from_secs(env_number("CUA_HTTP_TIMEOUT_SECS", 120u64)),
            features: FeatureFlags::from_env(),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            gate: GateConfig {
                max_concurrent_runs: self.max_concurrent_runs,
                max_runs_per_tenant: self.max_runs_per_tenant,
            },
            keepalive_interval: self.keepalive_interval,
            wait_interval: DEFAULT_WAIT_INTERVAL,
            vm_ready_timeout: self.http_timeout,
        }
    }

    pub fn endpoints(&self) -> HttpEndpoints {
        HttpEndpoints {
            vm_url: self.vm_url.clone(),
            predictor_url: self.predictor_url.clone(),
            narrator_url: self.narrator_url.clone(),
            inference_url: self.inference_url.clone(),
            timeout: self.http_timeout,
        }
    }

    /// Base config for a new run, with the feature flags applied
    pub fn run_config(&self, task: &str) -> RunConfig {
        RunConfig {
            enable_reflection: self.features.reflection,
            enable_code_execution: self.features.code_execution,
            ..RunConfig::new(task)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag_values() {
        for raw in ["1", "true", " YES ", "on"] {
            assert_eq!(parse_flag(raw), Some(true), "{raw}");
        }
        for raw in ["0", "False", "no", "off"] {
            assert_eq!(parse_flag(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_run_config_applies_feature_flags() {
        let config = ServerConfig {
            features: FeatureFlags {
                reflection: false,
                code_execution: true,
            },
            ..ServerConfig::default()
        };

        let run_config = config.run_config("open the browser");

        assert_eq!(run_config.task, "open the browser");
        assert!(!run_config.enable_reflection);
        assert!(run_config.enable_code_execution);
        assert_eq!(run_config.max_steps, 15);
    }

    #[test]
    fn test_runner_config_carries_limits() {
        let config = ServerConfig {
            max_concurrent_runs: 4,
            max_runs_per_tenant: 2,
            ..ServerConfig::default()
        };

        let runner = config.runner_config();

        assert_eq!(runner.gate.max_concurrent_runs, 4);
        assert_eq!(runner.gate.max_runs_per_tenant, 2);
        assert_eq!(runner.keepalive_interval, Duration::from_secs(15));
    }
}
