use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use valpipe_core::{AgentLogEntry, AgentStatus, PipelineResult, SessionId};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("server returned {status}: {detail}")]
    Status { status: StatusCode, detail: String },
    #[error("failed to parse response: {0}")]
    Decode(String),
    #[error("api url cannot be used as a base: {0}")]
    InvalidBase(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub service: String,
}

/// Per-agent entry in the server's live state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub logs: Vec<AgentLogEntry>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub elapsed_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineState {
    #[serde(default)]
    pub pipeline_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub is_running: bool,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSnapshot>,
}

/// `results` answers with the live state until the run has a final result.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResultsResponse {
    Running(PipelineState),
    Finished(PipelineResult),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptAck {
    pub status: String,
    pub agent: String,
    #[serde(default)]
    pub prompt_length: usize,
}

/// Request/response collaborator that starts a run and resolves with its
/// final result once the server-side pipeline finishes.
#[async_trait]
pub trait PipelineApi: Send + Sync {
    async fn start_pipeline(
        &self,
        session: &SessionId,
        prompts: &BTreeMap<String, String>,
    ) -> Result<PipelineResult, ApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpPipelineApi {
    client: Client,
    base_url: Url,
}

impl HttpPipelineApi {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, ApiError> {
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidBase(base_url.to_string()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.send_json(self.request(Method::GET, &["api", "health"])?).await
    }

    pub async fn fetch_results(&self, session: &SessionId) -> Result<ResultsResponse, ApiError> {
        let req = self.request(Method::GET, &["api", "pipeline", "results", session.as_str()])?;
        self.send_json(req).await
    }

    pub async fn fetch_state(&self, session: &SessionId) -> Result<PipelineState, ApiError> {
        let req = self.request(Method::GET, &["api", "pipeline", "state", session.as_str()])?;
        self.send_json(req).await
    }

    pub async fn update_agent_prompt(
        &self,
        session: &SessionId,
        agent: &str,
        system_prompt: &str,
    ) -> Result<PromptAck, ApiError> {
        let req = self
            .request(Method::POST, &["api", "agent", "prompt", session.as_str(), agent])?
            .json(&json!({ "system_prompt": system_prompt }));
        self.send_json(req).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidBase(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, ApiError> {
        Ok(self.client.request(method, self.endpoint(segments)?))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status,
                detail: error_detail(&body),
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| ApiError::Decode(err.to_string()))
    }
}

#[async_trait]
impl PipelineApi for HttpPipelineApi {
    async fn start_pipeline(
        &self,
        session: &SessionId,
        prompts: &BTreeMap<String, String>,
    ) -> Result<PipelineResult, ApiError> {
        let mut req = self.request(Method::POST, &["api", "pipeline", "start", session.as_str()])?;
        if !prompts.is_empty() {
            req = req.json(prompts);
        }
        self.send_json(req).await
    }
}

/// Pulls `detail` out of an error body, falling back to the raw text.
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("detail") {
            Some(Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => body.trim().to_string(),
        },
        _ => body.trim().to_string(),
    }
}
