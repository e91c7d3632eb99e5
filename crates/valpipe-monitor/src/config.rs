use std::time::Duration;
use thiserror::Error;
use url::Url;
use valpipe_core::{default_roster, SessionId};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_SIM_INTERVAL_SECS: u64 = 8;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
/// Floor for the retry delay once backoff has kicked in.
pub const MIN_RECONNECT_STEP: Duration = Duration::from_millis(100);
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field} url {value:?}: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("unsupported scheme for channel url: {0}")]
    UnsupportedScheme(String),
    #[error("invalid value for {name}: {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("reconnect delay must be greater than zero")]
    ZeroReconnectDelay,
    #[error("invalid prompt override {0:?}, expected AGENT=TEXT")]
    InvalidPrompt(String),
    #[error("no session id given (use --session or VALPIPE_SESSION_ID)")]
    MissingSession,
}

/// Delay between reconnect attempts. The first retry after a drop waits
/// `initial`; consecutive failures double it up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        }
    }
}

impl ReconnectPolicy {
    /// Fixed delay, no growth.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
        }
    }

    /// Builds a policy from millisecond settings. A zero initial delay would
    /// retry in a tight loop and is rejected.
    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Result<Self, ConfigError> {
        if initial_ms == 0 {
            return Err(ConfigError::ZeroReconnectDelay);
        }
        Ok(Self {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
        })
    }

    pub fn next(&self, current: Duration) -> Duration {
        let ceiling = self.max.max(self.initial).max(MIN_RECONNECT_STEP);
        let next = (current + current).max(MIN_RECONNECT_STEP);
        if next > ceiling {
            ceiling
        } else {
            next
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub api_url: Url,
    /// Explicit channel endpoint. When unset it is derived from `api_url`.
    pub ws_url: Option<Url>,
    pub roster: Vec<String>,
    pub sim_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
}

impl MonitorConfig {
    pub fn new(api_url: Url) -> Self {
        Self {
            api_url,
            ws_url: None,
            roster: default_roster(),
            sim_interval: Duration::from_secs(DEFAULT_SIM_INTERVAL_SECS),
            reconnect: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Session-scoped channel endpoint, `ws(s)://host/ws/pipeline/{session}`.
    pub fn channel_url(&self, session: &SessionId) -> Result<Url, ConfigError> {
        let mut url = match &self.ws_url {
            Some(url) => url.clone(),
            None => {
                let mut url = self.api_url.clone();
                let scheme = match url.scheme() {
                    "http" | "ws" => "ws",
                    "https" | "wss" => "wss",
                    other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
                };
                url.set_scheme(scheme)
                    .map_err(|_| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
                url.set_path("/ws/pipeline");
                url.set_query(None);
                url
            }
        };
        let value = url.to_string();
        url.path_segments_mut()
            .map_err(|_| ConfigError::InvalidUrl {
                field: "channel",
                value,
                reason: "cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .push(session.as_str());
        Ok(url)
    }
}

pub fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim()).map_err(|err| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

/// Splits an `AGENT=TEXT` override.
pub fn parse_prompt_override(raw: &str) -> Result<(String, String), ConfigError> {
    let (agent, prompt) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidPrompt(raw.to_string()))?;
    let agent = agent.trim();
    if agent.is_empty() {
        return Err(ConfigError::InvalidPrompt(raw.to_string()));
    }
    Ok((agent.to_string(), prompt.to_string()))
}
