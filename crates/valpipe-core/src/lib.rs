pub mod clock;
pub mod latch;
pub mod simulator;
pub mod store;
pub mod view;
pub mod wire;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Roster used before the server announces one with `pipeline_start`.
pub const DEFAULT_ROSTER: [&str; 7] = [
    "Guardian",
    "Forensic",
    "Historian",
    "Inspector",
    "GeoValidator",
    "DocumentComparator",
    "Strategist",
];

pub fn default_roster() -> Vec<String> {
    DEFAULT_ROSTER.iter().map(|name| name.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Queued,
    Processing,
    Success,
    Fail,
    Warn,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Queued => "queued",
            AgentStatus::Processing => "processing",
            AgentStatus::Success => "success",
            AgentStatus::Fail => "fail",
            AgentStatus::Warn => "warn",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Success | AgentStatus::Fail | AgentStatus::Warn)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "idle" => Ok(AgentStatus::Idle),
            "queued" => Ok(AgentStatus::Queued),
            "processing" => Ok(AgentStatus::Processing),
            "success" => Ok(AgentStatus::Success),
            "fail" => Ok(AgentStatus::Fail),
            "warn" => Ok(AgentStatus::Warn),
            other => Err(format!("Unknown agent status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Thinking,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Thinking => "thinking",
        }
    }

    /// Lenient parse: anything unrecognised is reported as `info`.
    pub fn parse_lossy(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "thinking" => LogLevel::Thinking,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(LogLevel::parse_lossy).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentLogEntry {
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: f64,
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
}

/// Final aggregate of a run. Only the fields the monitor reports on are
/// typed; everything else is carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semaphore: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semaphore_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_category: Option<i64>,
    #[serde(default)]
    pub agents: BTreeMap<String, Value>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// Accepts epoch seconds as a number or a numeric string.
pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range")),
        Value::String(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom),
        Value::Null => Ok(0.0),
        _ => Err(serde::de::Error::custom("expected number or string for timestamp")),
    }
}
