use crate::clock::ElapsedClock;
use crate::latch::CompletionSource;
use crate::simulator::FallbackSimulator;
use crate::store::PipelineStore;
use crate::{AgentLogEntry, AgentStatus, ConnectionState, PipelineResult, SessionId};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentView {
    pub name: String,
    pub status: AgentStatus,
    /// Status comes from the fallback simulator rather than the channel.
    pub simulated: bool,
    pub logs: Vec<AgentLogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
}

/// Read-only snapshot of everything the user sees for the active session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineView {
    pub session: Option<SessionId>,
    pub connection: ConnectionState,
    pub run_active: bool,
    pub pipeline_id: Option<String>,
    pub agents: Vec<AgentView>,
    pub elapsed_secs: u64,
    pub simulation_pointer: Option<usize>,
    pub simulation_engaged: bool,
    pub result: Option<PipelineResult>,
    pub result_source: Option<CompletionSource>,
    pub last_error: Option<String>,
}

impl PipelineView {
    pub fn derive(
        store: &PipelineStore,
        simulator: &FallbackSimulator,
        clock: &ElapsedClock,
        now: Instant,
    ) -> Self {
        let agents = store
            .roster()
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let (status, simulated) = if store.is_reported(name) {
                    (store.status(name), false)
                } else {
                    match simulator.derived_status(index) {
                        Some(status) => (status, true),
                        None => (store.status(name), false),
                    }
                };
                AgentView {
                    name: name.clone(),
                    status,
                    simulated,
                    logs: store.logs(name).to_vec(),
                    elapsed_time: store.agent_elapsed(name),
                }
            })
            .collect();

        Self {
            session: store.session().cloned(),
            connection: store.connection(),
            run_active: store.run_active(),
            pipeline_id: store.pipeline_id().map(str::to_string),
            agents,
            elapsed_secs: clock.elapsed_secs(now),
            simulation_pointer: simulator.pointer(),
            simulation_engaged: simulator.is_engaged(),
            result: store.result().cloned(),
            result_source: store.result_source(),
            last_error: store.last_error().map(str::to_string),
        }
    }

    pub fn agent(&self, name: &str) -> Option<&AgentView> {
        self.agents.iter().find(|agent| agent.name == name)
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}
