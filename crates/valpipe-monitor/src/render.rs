use chrono::{DateTime, Local};
use valpipe_core::view::{AgentView, PipelineView};
use valpipe_core::AgentLogEntry;

/// Turns successive views into plain progress lines, printing only what
/// changed since the previous view.
#[derive(Debug, Default)]
pub struct ProgressRenderer {
    last: Option<PipelineView>,
}

impl ProgressRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, view: &PipelineView) -> Vec<String> {
        let mut lines = Vec::new();
        let prev = self.last.take();
        let prev = prev.as_ref();

        if prev.map(|p| &p.session) != Some(&view.session) {
            match &view.session {
                Some(session) => lines.push(format!("session {session}")),
                None if prev.is_some() => lines.push("session cleared".to_string()),
                None => {}
            }
        }
        if prev.map(|p| p.connection) != Some(view.connection) {
            lines.push(format!("channel {}", view.connection));
        }
        if view.run_active && !prev.is_some_and(|p| p.run_active) {
            match &view.pipeline_id {
                Some(id) => lines.push(format!("run active (pipeline {id})")),
                None => lines.push("run active".to_string()),
            }
        }

        for agent in &view.agents {
            let before = prev.and_then(|p| p.agent(&agent.name));
            if before.map(|b| (b.status, b.simulated)) != Some((agent.status, agent.simulated)) {
                lines.push(status_line(agent));
            }
            let seen = before.map(|b| b.logs.len()).unwrap_or(0);
            for entry in agent.logs.iter().skip(seen) {
                lines.push(log_line(&agent.name, entry));
            }
        }

        if view.last_error.is_some() && prev.map(|p| &p.last_error) != Some(&view.last_error) {
            if let Some(err) = &view.last_error {
                lines.push(format!("error: {err}"));
            }
        }
        if let Some(result) = &view.result {
            if !prev.is_some_and(|p| p.result.is_some()) {
                let source = view
                    .result_source
                    .map(|source| source.as_str())
                    .unwrap_or("unknown");
                let mut line = format!(
                    "result via {source}: semaphore={}",
                    result.semaphore.as_deref().unwrap_or("?")
                );
                if let Some(category) = result.final_category {
                    line.push_str(&format!(" category={category}"));
                }
                if let Some(total) = result.total_time {
                    line.push_str(&format!(" server_time={total:.1}s"));
                }
                line.push_str(&format!(" elapsed={}s", view.elapsed_secs));
                lines.push(line);
            }
        }

        self.last = Some(view.clone());
        lines
    }
}

fn status_line(agent: &AgentView) -> String {
    let mut line = format!("{:<20} {}", agent.name, agent.status);
    if agent.simulated {
        line.push_str(" (simulated)");
    } else if agent.status.is_terminal() {
        if let Some(elapsed) = agent.elapsed_time {
            line.push_str(&format!(" ({elapsed:.1}s)"));
        }
    }
    line
}

fn log_line(agent: &str, entry: &AgentLogEntry) -> String {
    format!(
        "  {} {agent} [{}] {}",
        clock_time(entry.timestamp),
        entry.level,
        entry.message
    )
}

fn clock_time(epoch_secs: f64) -> String {
    if !epoch_secs.is_finite() || epoch_secs <= 0.0 {
        return "--:--:--".to_string();
    }
    let secs = epoch_secs.trunc() as i64;
    let nanos = (epoch_secs.fract() * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos)
        .map(|at| at.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}
