use crate::latch::{CompletionSource, Latch, LatchOutcome};
use crate::wire::PipelineMsg;
use crate::{AgentLogEntry, AgentStatus, ConnectionState, PipelineResult, SessionId};
use std::collections::{HashMap, HashSet};

/// Identifies one user-triggered run. Request outcomes carry it back so a
/// response for a torn-down session or an older run cannot land.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunTicket {
    pub session: SessionId,
    pub generation: u64,
}

/// What a handled event did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    StaleSession,
    RunStarted { agents: usize },
    StatusChanged { agent: String, status: AgentStatus },
    LogAppended { agent: String },
    Completed(LatchOutcome),
    Unchanged,
}

#[derive(Debug, Clone, Default)]
struct RunState {
    active: bool,
    started_by_user: bool,
    pipeline_id: Option<String>,
    generation: u64,
}

/// Per-session pipeline state. Every mutation is stamped with the session it
/// was produced for and ignored if that session is no longer active.
#[derive(Debug, Clone)]
pub struct PipelineStore {
    base_roster: Vec<String>,
    session: Option<SessionId>,
    roster: Vec<String>,
    statuses: HashMap<String, AgentStatus>,
    reported: HashSet<String>,
    logs: HashMap<String, Vec<AgentLogEntry>>,
    agent_elapsed: HashMap<String, f64>,
    result: Latch<PipelineResult>,
    run: RunState,
    connection: ConnectionState,
    last_error: Option<String>,
}

impl PipelineStore {
    pub fn new(base_roster: Vec<String>) -> Self {
        let mut store = Self {
            roster: base_roster.clone(),
            base_roster,
            session: None,
            statuses: HashMap::new(),
            reported: HashSet::new(),
            logs: HashMap::new(),
            agent_elapsed: HashMap::new(),
            result: Latch::new(),
            run: RunState::default(),
            connection: ConnectionState::Disconnected,
            last_error: None,
        };
        store.reset_agents();
        store
    }

    /// Makes `session` the active one, discarding everything owned by the
    /// previous session.
    pub fn open_session(&mut self, session: SessionId) {
        self.reset_session();
        self.session = Some(session);
    }

    pub fn clear_session(&mut self) {
        self.reset_session();
        self.session = None;
    }

    /// User-triggered run. Returns `None` without an active session.
    pub fn begin_run(&mut self) -> Option<RunTicket> {
        let session = self.session.clone()?;
        self.reset_run();
        self.run.active = true;
        self.run.started_by_user = true;
        self.run.generation += 1;
        Some(RunTicket {
            session,
            generation: self.run.generation,
        })
    }

    pub fn apply(&mut self, stamp: &SessionId, msg: PipelineMsg) -> StoreChange {
        if !self.is_current(stamp) {
            return StoreChange::StaleSession;
        }
        match msg {
            PipelineMsg::PipelineStart(payload) => {
                let started_by_user = self.run.started_by_user;
                self.roster = payload.agents;
                self.reset_run();
                self.run.active = true;
                self.run.started_by_user = started_by_user;
                self.run.pipeline_id = payload.pipeline_id;
                StoreChange::RunStarted {
                    agents: self.roster.len(),
                }
            }
            PipelineMsg::AgentStatus(payload) => {
                self.statuses.insert(payload.agent.clone(), payload.status);
                if !payload.status.is_idle() {
                    self.reported.insert(payload.agent.clone());
                }
                if let Some(elapsed) = payload.elapsed_time {
                    self.agent_elapsed.insert(payload.agent.clone(), elapsed);
                }
                StoreChange::StatusChanged {
                    agent: payload.agent,
                    status: payload.status,
                }
            }
            PipelineMsg::AgentLog(payload) => {
                self.logs.entry(payload.agent.clone()).or_default().push(AgentLogEntry {
                    timestamp: payload.timestamp,
                    message: payload.message,
                    level: payload.level,
                });
                StoreChange::LogAppended { agent: payload.agent }
            }
            PipelineMsg::PipelineComplete(payload) => {
                self.run.active = false;
                StoreChange::Completed(self.result.offer(CompletionSource::Stream, payload.result))
            }
            PipelineMsg::PromptUpdated(_) | PipelineMsg::Other => StoreChange::Unchanged,
        }
    }

    /// Offers a result produced outside the channel for the run `ticket`
    /// names. Returns `None` when the ticket is stale.
    pub fn offer_result(
        &mut self,
        ticket: &RunTicket,
        source: CompletionSource,
        result: PipelineResult,
    ) -> Option<LatchOutcome> {
        if !self.is_current_run(ticket) {
            return None;
        }
        self.run.active = false;
        Some(self.result.offer(source, result))
    }

    /// Stores a user-visible request failure. Run state is left as is since
    /// the channel may still complete the run. Returns whether it was kept.
    pub fn record_error(&mut self, ticket: &RunTicket, message: impl Into<String>) -> bool {
        if !self.is_current_run(ticket) || self.result.is_set() {
            return false;
        }
        self.last_error = Some(message.into());
        true
    }

    pub fn set_connection(&mut self, stamp: &SessionId, state: ConnectionState) -> bool {
        if !self.is_current(stamp) {
            return false;
        }
        self.connection = state;
        true
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    pub fn status(&self, agent: &str) -> AgentStatus {
        self.statuses.get(agent).copied().unwrap_or_default()
    }

    /// Every status in the map, including agents outside the roster.
    pub fn statuses(&self) -> impl Iterator<Item = AgentStatus> + '_ {
        self.statuses.values().copied()
    }

    /// Whether the channel has asserted a non-idle status for `agent` in
    /// this run.
    pub fn is_reported(&self, agent: &str) -> bool {
        self.reported.contains(agent)
    }

    pub fn logs(&self, agent: &str) -> &[AgentLogEntry] {
        self.logs.get(agent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn agent_elapsed(&self, agent: &str) -> Option<f64> {
        self.agent_elapsed.get(agent).copied()
    }

    pub fn result(&self) -> Option<&PipelineResult> {
        self.result.get()
    }

    pub fn result_source(&self) -> Option<CompletionSource> {
        self.result.source()
    }

    pub fn has_result(&self) -> bool {
        self.result.is_set()
    }

    pub fn run_active(&self) -> bool {
        self.run.active
    }

    pub fn started_by_user(&self) -> bool {
        self.run.started_by_user
    }

    pub fn pipeline_id(&self) -> Option<&str> {
        self.run.pipeline_id.as_deref()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn is_current(&self, stamp: &SessionId) -> bool {
        self.session.as_ref() == Some(stamp)
    }

    fn is_current_run(&self, ticket: &RunTicket) -> bool {
        self.is_current(&ticket.session) && self.run.generation == ticket.generation
    }

    fn reset_agents(&mut self) {
        self.statuses = self
            .roster
            .iter()
            .map(|agent| (agent.clone(), AgentStatus::Idle))
            .collect();
        self.reported.clear();
        self.logs.clear();
        self.agent_elapsed.clear();
    }

    fn reset_run(&mut self) {
        self.reset_agents();
        self.result.reset();
        self.last_error = None;
        self.run.active = false;
        self.run.started_by_user = false;
        self.run.pipeline_id = None;
    }

    fn reset_session(&mut self) {
        self.roster = self.base_roster.clone();
        self.reset_run();
        self.connection = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_message, PipelineCompletePayload};

    fn roster(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn msg(raw: &str) -> PipelineMsg {
        decode_message(raw).expect("decode")
    }

    fn result_named(name: &str) -> PipelineResult {
        PipelineResult {
            semaphore: Some(name.to_string()),
            ..PipelineResult::default()
        }
    }

    fn complete(name: &str) -> PipelineMsg {
        PipelineMsg::PipelineComplete(PipelineCompletePayload {
            result: result_named(name),
            pipeline_id: None,
            timestamp: None,
        })
    }

    fn open(names: &[&str]) -> (PipelineStore, SessionId) {
        let session = SessionId::from("s-1");
        let mut store = PipelineStore::new(roster(names));
        store.open_session(session.clone());
        (store, session)
    }

    #[test]
    fn full_stream_scenario_ends_with_latched_result() {
        let (mut store, sid) = open(&["A", "B", "C"]);
        store.apply(&sid, msg(r#"{"type":"pipeline_start","agents":["A","B","C"]}"#));
        store.apply(&sid, msg(r#"{"type":"agent_status","agent":"A","status":"processing"}"#));
        store.apply(&sid, msg(r#"{"type":"agent_status","agent":"A","status":"success"}"#));
        store.apply(&sid, msg(r#"{"type":"agent_status","agent":"B","status":"processing"}"#));
        let change = store.apply(&sid, complete("R"));

        assert_eq!(change, StoreChange::Completed(LatchOutcome::Adopted));
        assert_eq!(store.status("A"), AgentStatus::Success);
        assert_eq!(store.status("B"), AgentStatus::Processing);
        assert_eq!(store.status("C"), AgentStatus::Idle);
        assert!(!store.run_active());
        assert_eq!(store.result(), Some(&result_named("R")));
        assert_eq!(store.result_source(), Some(CompletionSource::Stream));
    }

    #[test]
    fn latest_status_wins_in_any_order() {
        let (mut store, sid) = open(&["A"]);
        for status in ["success", "processing", "queued", "fail", "warn"] {
            store.apply(
                &sid,
                msg(&format!(r#"{{"type":"agent_status","agent":"A","status":"{status}"}}"#)),
            );
            assert_eq!(store.status("A"), status.parse::<AgentStatus>().expect("status"));
        }
        // duplicates are harmless
        let dup = msg(r#"{"type":"agent_status","agent":"A","status":"queued"}"#);
        store.apply(&sid, dup.clone());
        store.apply(&sid, dup);
        assert_eq!(store.status("A"), AgentStatus::Queued);
    }

    #[test]
    fn pipeline_start_resets_prior_state() {
        let (mut store, sid) = open(&["A", "B"]);
        store.apply(&sid, msg(r#"{"type":"agent_status","agent":"A","status":"fail"}"#));
        store.apply(&sid, msg(r#"{"type":"agent_log","agent":"A","message":"boom","level":"error"}"#));
        store.apply(&sid, complete("old"));
        assert!(store.has_result());

        let change = store.apply(
            &sid,
            msg(r#"{"type":"pipeline_start","pipeline_id":"p2","agents":["A","B","C"]}"#),
        );
        assert_eq!(change, StoreChange::RunStarted { agents: 3 });
        assert_eq!(store.roster(), roster(&["A", "B", "C"]).as_slice());
        for agent in ["A", "B", "C"] {
            assert_eq!(store.status(agent), AgentStatus::Idle);
            assert!(store.logs(agent).is_empty());
            assert!(!store.is_reported(agent));
        }
        assert!(store.result().is_none());
        assert!(store.run_active());
        assert_eq!(store.pipeline_id(), Some("p2"));
    }

    #[test]
    fn logs_keep_arrival_order_per_agent() {
        let (mut store, sid) = open(&["A", "B"]);
        store.apply(&sid, msg(r#"{"type":"agent_log","agent":"A","message":"one","timestamp":3}"#));
        store.apply(&sid, msg(r#"{"type":"agent_log","agent":"B","message":"other","timestamp":1}"#));
        store.apply(&sid, msg(r#"{"type":"agent_log","agent":"A","message":"two","timestamp":2}"#));
        let messages: Vec<_> = store.logs("A").iter().map(|entry| entry.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two"]);
        assert_eq!(store.logs("B").len(), 1);
    }

    #[test]
    fn request_result_first_then_stream_is_discarded() {
        let (mut store, sid) = open(&["A"]);
        let ticket = store.begin_run().expect("ticket");
        assert_eq!(
            store.offer_result(&ticket, CompletionSource::Request, result_named("R1")),
            Some(LatchOutcome::Adopted)
        );
        let change = store.apply(&sid, complete("R2"));
        assert_eq!(
            change,
            StoreChange::Completed(LatchOutcome::Discarded {
                holder: CompletionSource::Request
            })
        );
        assert_eq!(store.result(), Some(&result_named("R1")));
    }

    #[test]
    fn request_error_keeps_run_alive() {
        let (mut store, sid) = open(&["A"]);
        let ticket = store.begin_run().expect("ticket");
        store.apply(&sid, msg(r#"{"type":"agent_status","agent":"A","status":"processing"}"#));
        assert!(store.record_error(&ticket, "HTTP 500"));
        assert_eq!(store.last_error(), Some("HTTP 500"));
        assert!(store.run_active());
        assert_eq!(store.status("A"), AgentStatus::Processing);

        store.apply(&sid, complete("late"));
        assert_eq!(store.result(), Some(&result_named("late")));
        assert!(!store.record_error(&ticket, "too late"));
    }

    #[test]
    fn stale_session_events_are_ignored() {
        let (mut store, old) = open(&["A"]);
        let ticket = store.begin_run().expect("ticket");
        let fresh = SessionId::from("s-2");
        store.open_session(fresh.clone());

        let change = store.apply(&old, msg(r#"{"type":"agent_status","agent":"A","status":"success"}"#));
        assert_eq!(change, StoreChange::StaleSession);
        assert!(!store.set_connection(&old, ConnectionState::Connected));
        assert_eq!(store.offer_result(&ticket, CompletionSource::Request, result_named("x")), None);
        assert!(!store.record_error(&ticket, "old"));

        assert_eq!(store.status("A"), AgentStatus::Idle);
        assert_eq!(store.connection(), ConnectionState::Disconnected);
        assert!(store.result().is_none());
        assert!(store.set_connection(&fresh, ConnectionState::Connected));
    }

    #[test]
    fn older_run_ticket_cannot_latch_into_newer_run() {
        let (mut store, _sid) = open(&["A"]);
        let first = store.begin_run().expect("first");
        let second = store.begin_run().expect("second");
        assert_eq!(store.offer_result(&first, CompletionSource::Request, result_named("old")), None);
        assert_eq!(
            store.offer_result(&second, CompletionSource::Request, result_named("new")),
            Some(LatchOutcome::Adopted)
        );
    }

    #[test]
    fn malformed_and_unknown_messages_change_nothing() {
        let (mut store, sid) = open(&["A"]);
        store.apply(&sid, msg(r#"{"type":"agent_status","agent":"A","status":"queued"}"#));
        assert_eq!(store.apply(&sid, PipelineMsg::Other), StoreChange::Unchanged);
        assert_eq!(
            store.apply(&sid, msg(r#"{"type":"prompt_updated","agent":"A"}"#)),
            StoreChange::Unchanged
        );
        assert_eq!(store.status("A"), AgentStatus::Queued);
    }

    #[test]
    fn begin_run_requires_a_session() {
        let mut store = PipelineStore::new(roster(&["A"]));
        assert!(store.begin_run().is_none());
        store.open_session(SessionId::from("s"));
        store.clear_session();
        assert!(store.begin_run().is_none());
        assert!(store.session().is_none());
    }
}
