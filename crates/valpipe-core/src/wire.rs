use crate::{deserialize_timestamp, AgentStatus, LogLevel, PipelineResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Server-to-client messages on the pipeline channel, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineMsg {
    PipelineStart(PipelineStartPayload),
    AgentStatus(AgentStatusPayload),
    AgentLog(AgentLogPayload),
    PipelineComplete(PipelineCompletePayload),
    PromptUpdated(PromptUpdatedPayload),
    #[serde(other)]
    Other,
}

impl PipelineMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineMsg::PipelineStart(_) => "pipeline_start",
            PipelineMsg::AgentStatus(_) => "agent_status",
            PipelineMsg::AgentLog(_) => "agent_log",
            PipelineMsg::PipelineComplete(_) => "pipeline_complete",
            PipelineMsg::PromptUpdated(_) => "prompt_updated",
            PipelineMsg::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStartPayload {
    pub agents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStatusPayload {
    pub agent: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentLogPayload {
    pub agent: String,
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineCompletePayload {
    pub result: PipelineResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptUpdatedPayload {
    pub agent: String,
}

/// Client-to-server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    UpdatePrompt { agent: String, prompt: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame is not valid utf-8")]
    InvalidUtf8,
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn decode_message(text: &str) -> Result<PipelineMsg, FrameError> {
    decode_message_with_limit(text, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_message_with_limit(text: &str, max_frame_bytes: usize) -> Result<PipelineMsg, FrameError> {
    let raw = text.trim();
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Binary frames are accepted when they carry UTF-8 JSON.
pub fn decode_message_bytes(bytes: &[u8]) -> Result<PipelineMsg, FrameError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FrameError::InvalidUtf8)?;
    decode_message(text)
}

pub fn encode_client_message(msg: &ClientMsg) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(msg).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > DEFAULT_MAX_FRAME_BYTES {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        });
    }
    Ok(encoded)
}
