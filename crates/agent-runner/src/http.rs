//! reqwest clients for the collaborator services

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cua_core::run::{ChatMessage, Run};

use crate::classify::ControlAction;
use crate::collaborators::{
    decode_screenshot, encode_screenshot, AgentPredictor, BehaviorNarrator, CollaboratorFactory,
    Collaborators, ComponentState, ExecutionResult, HumanInference, InferenceResult, Narration,
    Observation, Prediction, VmSession,
};
use crate::error::{Result, RunnerError};

/// Snapshot key of the predictor's remote state
pub const PREDICTOR_COMPONENT: &str = "predictor";

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn build_client(timeout: Duration) -> Client {
    // Collaborators run next to the runner; skip any system proxy
    Client::builder()
        .no_proxy()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

/// Turn a non-2xx response into an error built by `make`
async fn check_status(res: Response, make: fn(String) -> RunnerError) -> Result<Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let error_text = res.text().await.unwrap_or_default();
    Err(make(format!("Service returned {}: {}", status, error_text)))
}

async fn read_json<T: DeserializeOwned>(res: Response, make: fn(String) -> RunnerError) -> Result<T> {
    let res = check_status(res, make).await?;
    res.json::<T>()
        .await
        .map_err(|e| make(format!("Invalid response body: {}", e)))
}

// ============================================================================
// VM session
// ============================================================================

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    command: &'a str,
}

#[derive(Deserialize)]
struct ScreenSize {
    width: u32,
    height: u32,
}

pub struct HttpVmSession {
    client: Client,
    url: String,
}

impl HttpVmSession {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            url: url.into(),
        }
    }

    async fn get(&self, path: &str) -> Result<Response> {
        let res = self
            .client
            .get(endpoint(&self.url, path))
            .send()
            .await
            .map_err(|e| RunnerError::vm(format!("Failed to connect to VM session: {}", e)))?;
        check_status(res, RunnerError::vm).await
    }
}

#[async_trait]
impl VmSession for HttpVmSession {
    async fn execute(&self, payload: &str) -> Result<ExecutionResult> {
        debug!("Sending command to VM session: {}/execute", self.url);
        let res = self
            .client
            .post(endpoint(&self.url, "execute"))
            .json(&ExecuteRequest { command: payload })
            .send()
            .await
            .map_err(|e| RunnerError::vm(format!("Failed to connect to VM session: {}", e)))?;
        read_json(res, RunnerError::vm).await
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        let bytes = self
            .get("screenshot")
            .await?
            .bytes()
            .await
            .map_err(|e| RunnerError::vm(format!("Failed to read screenshot: {}", e)))?;
        Ok(bytes.to_vec())
    }

    async fn screen_size(&self) -> Result<(u32, u32)> {
        let size: ScreenSize = read_json(self.get("screen_size").await?, RunnerError::vm).await?;
        Ok((size.width, size.height))
    }

    async fn platform(&self) -> Result<String> {
        let text = self
            .get("platform")
            .await?
            .text()
            .await
            .map_err(|e| RunnerError::vm(format!("Failed to read platform: {}", e)))?;
        Ok(text.trim().to_string())
    }

    async fn wait_for_health(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get("health").await {
                Ok(_) => {
                    info!("VM session at {} is healthy", self.url);
                    return Ok(());
                }
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(RunnerError::vm(format!(
                        "VM session not healthy after {:?}: {}",
                        timeout, e
                    )));
                }
                Err(e) => debug!("VM session not ready yet: {}", e),
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

// ============================================================================
// Predictor
// ============================================================================

#[derive(Serialize)]
struct PredictRequest<'a> {
    task: &'a str,
    /// Control keywords the predictor may answer with
    vocabulary: String,
    observation: ObservationPayload<'a>,
}

/// Observation as it crosses the wire, screenshots base64-encoded
#[derive(Serialize)]
struct ObservationPayload<'a> {
    step_index: u32,
    screenshot: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reflection_screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_behavior: Option<&'a Narration>,
    messages: &'a [ChatMessage],
    platform: &'a str,
    enable_reflection: bool,
    enable_code_execution: bool,
}

impl<'a> From<&'a Observation> for ObservationPayload<'a> {
    fn from(observation: &'a Observation) -> Self {
        Self {
            step_index: observation.step_index,
            screenshot: encode_screenshot(&observation.screenshot),
            reflection_screenshot: observation
                .reflection_screenshot
                .as_deref()
                .map(encode_screenshot),
            previous_behavior: observation.previous_behavior.as_ref(),
            messages: &observation.messages,
            platform: &observation.platform,
            enable_reflection: observation.enable_reflection,
            enable_code_execution: observation.enable_code_execution,
        }
    }
}

/// Predictor service. Its conversation memory lives server-side and is
/// carried across handbacks through `/state`.
pub struct HttpPredictor {
    client: Client,
    url: String,
}

impl HttpPredictor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AgentPredictor for HttpPredictor {
    async fn predict(&self, task: &str, observation: &Observation) -> Result<Prediction> {
        let req = PredictRequest {
            task,
            vocabulary: ControlAction::vocabulary(),
            observation: ObservationPayload::from(observation),
        };
        let res = self
            .client
            .post(endpoint(&self.url, "predict"))
            .json(&req)
            .send()
            .await
            .map_err(|e| RunnerError::predictor(format!("Failed to connect to predictor: {}", e)))?;
        read_json(res, RunnerError::predictor).await
    }
}

#[async_trait]
impl ComponentState for HttpPredictor {
    fn component_name(&self) -> &str {
        PREDICTOR_COMPONENT
    }

    async fn export_state(&self) -> Result<serde_json::Value> {
        let res = self
            .client
            .get(endpoint(&self.url, "state"))
            .send()
            .await
            .map_err(|e| RunnerError::predictor(format!("Failed to export predictor state: {}", e)))?;
        read_json(res, RunnerError::predictor).await
    }

    async fn import_state(&self, state: serde_json::Value) -> Result<()> {
        let res = self
            .client
            .put(endpoint(&self.url, "state"))
            .json(&state)
            .send()
            .await
            .map_err(|e| RunnerError::predictor(format!("Failed to import predictor state: {}", e)))?;
        check_status(res, RunnerError::predictor).await?;
        Ok(())
    }
}

// ============================================================================
// Narrator
// ============================================================================

#[derive(Serialize)]
struct NarrateRequest<'a> {
    before: String,
    after: String,
    action: &'a str,
}

pub struct HttpNarrator {
    client: Client,
    url: String,
}

impl HttpNarrator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            url: url.into(),
        }
    }
}

#[async_trait]
impl BehaviorNarrator for HttpNarrator {
    async fn narrate(&self, before: &[u8], after: &[u8], action: &str) -> Result<Narration> {
        let req = NarrateRequest {
            before: encode_screenshot(before),
            after: encode_screenshot(after),
            action,
        };
        let res = self
            .client
            .post(endpoint(&self.url, "narrate"))
            .json(&req)
            .send()
            .await
            .map_err(|e| RunnerError::predictor(format!("Failed to connect to narrator: {}", e)))?;
        read_json(res, RunnerError::predictor).await
    }
}

// ============================================================================
// Human inference
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InferRequest<'a> {
    request: &'a str,
    before_screenshot: &'a str,
    after_screenshot: &'a str,
}

pub struct HttpHumanInference {
    client: Client,
    url: String,
}

impl HttpHumanInference {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            url: url.into(),
        }
    }
}

#[async_trait]
impl HumanInference for HttpHumanInference {
    async fn infer(&self, request: &str, before_b64: &str, after_b64: &str) -> Result<InferenceResult> {
        // Reject garbage before paying for a model call
        decode_screenshot(before_b64)
            .map_err(|e| RunnerError::inference(format!("Stored screenshot unusable: {}", e)))?;

        let req = InferRequest {
            request,
            before_screenshot: before_b64,
            after_screenshot: after_b64,
        };
        let res = self
            .client
            .post(endpoint(&self.url, "infer"))
            .json(&req)
            .send()
            .await
            .map_err(|e| RunnerError::inference(format!("Failed to connect to inference service: {}", e)))?;
        read_json(res, RunnerError::inference).await
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Service locations for [`HttpCollaboratorFactory`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpEndpoints {
    pub vm_url: String,
    pub predictor_url: String,
    pub narrator_url: String,
    pub inference_url: String,
    pub timeout: Duration,
}

/// Builds one set of HTTP clients per run
#[derive(Debug, Clone)]
pub struct HttpCollaboratorFactory {
    endpoints: HttpEndpoints,
}

impl HttpCollaboratorFactory {
    pub fn new(endpoints: HttpEndpoints) -> Self {
        Self { endpoints }
    }
}

impl CollaboratorFactory for HttpCollaboratorFactory {
    fn build(&self, run: &Run) -> Result<Collaborators> {
        let endpoints = &self.endpoints;
        for (name, url) in [
            ("VM session", &endpoints.vm_url),
            ("predictor", &endpoints.predictor_url),
            ("narrator", &endpoints.narrator_url),
            ("inference", &endpoints.inference_url),
        ] {
            if url.trim().is_empty() {
                return Err(RunnerError::setup(format!("No {} URL configured", name)));
            }
        }

        debug!("Building HTTP collaborators for run {}", run.id);
        let predictor = Arc::new(HttpPredictor::new(&endpoints.predictor_url, endpoints.timeout));
        Ok(Collaborators {
            vm: Arc::new(HttpVmSession::new(&endpoints.vm_url, endpoints.timeout)),
            predictor: predictor.clone(),
            narrator: Arc::new(HttpNarrator::new(&endpoints.narrator_url, endpoints.timeout)),
            inference: Arc::new(HttpHumanInference::new(&endpoints.inference_url, endpoints.timeout)),
            components: vec![predictor as Arc<dyn ComponentState>],
        })
    }
}
