use anyhow::Context;
use clap::Parser;
use std::collections::BTreeMap;
use std::env;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use valpipe_core::SessionId;
use valpipe_monitor::config::{
    parse_prompt_override, parse_url, ConfigError, MonitorConfig, ReconnectPolicy, DEFAULT_API_URL,
    DEFAULT_RECONNECT_DELAY_MS, DEFAULT_RECONNECT_MAX_MS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_SIM_INTERVAL_SECS,
};
use valpipe_monitor::logging::{init_logging, LogSettings};
use valpipe_monitor::render::ProgressRenderer;
use valpipe_monitor::{HttpPipelineApi, MonitorHandle, WsConnector};

#[derive(Parser, Debug)]
#[command(name = "valpipe-monitor", about = "Follow a validation pipeline run")]
struct Args {
    /// Base URL of the pipeline API.
    #[arg(long, default_value = "")]
    api_url: String,
    /// Channel endpoint; `/{session}` is appended.
    #[arg(long, default_value = "")]
    ws_url: String,
    #[arg(long, default_value = "")]
    session: String,
    /// Start the pipeline instead of only following it.
    #[arg(long)]
    run: bool,
    /// Custom system prompt, repeatable.
    #[arg(long = "prompt", value_name = "AGENT=TEXT")]
    prompts: Vec<String>,
    #[arg(long)]
    sim_interval_secs: Option<u64>,
    #[arg(long, default_value = "")]
    log_dir: String,
}

struct RuntimeConfig {
    monitor: MonitorConfig,
    session: SessionId,
    run: bool,
    prompts: BTreeMap<String, String>,
    log: LogSettings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args).context("invalid configuration")?;
    let _log_guard = init_logging(&config.log, config.session.as_str());

    let api = Arc::new(
        HttpPipelineApi::new(config.monitor.api_url.clone(), config.monitor.request_timeout)
            .context("failed to build api client")?,
    );
    match api.health().await {
        Ok(health) => info!(event = "api_healthy", status = %health.status, service = %health.service),
        Err(err) => warn!(event = "api_unreachable", url = %api.base_url(), error = %err),
    }

    let monitor = MonitorHandle::spawn(config.monitor.clone(), api.clone(), Arc::new(WsConnector));
    let mut views = monitor.subscribe();
    monitor.open_session(config.session.clone()).await?;
    if config.run {
        monitor.start_run(config.prompts.clone()).await?;
    } else {
        for (agent, prompt) in &config.prompts {
            match api.update_agent_prompt(&config.session, agent, prompt).await {
                Ok(ack) => info!(event = "prompt_applied", agent = %ack.agent, length = ack.prompt_length),
                Err(err) => warn!(event = "prompt_rejected", agent = %agent, error = %err),
            }
        }
    }

    let mut renderer = ProgressRenderer::new();
    let mut stdout = io::stdout();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        let view = views.borrow_and_update().clone();
        for line in renderer.render(&view) {
            writeln!(stdout, "{line}")?;
        }
        stdout.flush()?;
        if view.is_complete() {
            break;
        }
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = &mut interrupted => {
                info!(event = "interrupted");
                break;
            }
        }
    }

    monitor.shutdown().await;
    Ok(())
}

fn load_config(args: Args) -> Result<RuntimeConfig, ConfigError> {
    let api_url = parse_url("api", &resolve_string(&args.api_url, "VALPIPE_API_URL", DEFAULT_API_URL))?;
    let ws_url = resolve_string(&args.ws_url, "VALPIPE_WS_URL", "");
    let ws_url = if ws_url.is_empty() {
        None
    } else {
        Some(parse_url("ws", &ws_url)?)
    };
    let session = resolve_string(&args.session, "VALPIPE_SESSION_ID", "");
    if session.trim().is_empty() {
        return Err(ConfigError::MissingSession);
    }
    let session = SessionId::new(session.trim());

    let sim_interval = resolve_u64(
        args.sim_interval_secs,
        "VALPIPE_SIM_INTERVAL_SECS",
        DEFAULT_SIM_INTERVAL_SECS,
    )?;
    let reconnect = ReconnectPolicy::from_millis(
        resolve_u64(None, "VALPIPE_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)?,
        resolve_u64(None, "VALPIPE_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?,
    )?;
    let request_timeout = resolve_u64(
        None,
        "VALPIPE_REQUEST_TIMEOUT_SECS",
        DEFAULT_REQUEST_TIMEOUT_SECS,
    )?;

    let mut prompts = BTreeMap::new();
    for raw in &args.prompts {
        let (agent, prompt) = parse_prompt_override(raw)?;
        prompts.insert(agent, prompt);
    }

    let mut monitor = MonitorConfig::new(api_url);
    monitor.ws_url = ws_url;
    monitor.sim_interval = Duration::from_secs(sim_interval);
    monitor.reconnect = reconnect;
    monitor.request_timeout = Duration::from_secs(request_timeout);
    monitor.channel_url(&session)?;

    Ok(RuntimeConfig {
        monitor,
        session,
        run: args.run,
        prompts,
        log: LogSettings {
            level: resolve_string("", "VALPIPE_LOG_LEVEL", "info"),
            dir: resolve_string(&args.log_dir, "VALPIPE_LOG_DIR", ".valpipe/logs"),
            stderr: resolve_log_stderr(),
        },
    })
}

fn resolve_string(flag: &str, var: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = env::var(var) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn resolve_u64(flag: Option<u64>, var: &'static str, default: u64) -> Result<u64, ConfigError> {
    if let Some(value) = flag {
        return Ok(value);
    }
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            name: var,
            value,
        }),
        _ => Ok(default),
    }
}

fn resolve_log_stderr() -> bool {
    if let Ok(value) = env::var("VALPIPE_LOG_STDOUT") {
        match value.trim() {
            "1" | "true" | "TRUE" | "yes" | "YES" => return true,
            "0" | "false" | "FALSE" | "no" | "NO" => return false,
            _ => {}
        }
    }
    false
}
