use crate::api::{ApiError, PipelineApi};
use crate::config::MonitorConfig;
use crate::connection::{ChannelEvent, ConnectionManager, Connector};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use valpipe_core::clock::ElapsedClock;
use valpipe_core::latch::{CompletionSource, LatchOutcome};
use valpipe_core::simulator::FallbackSimulator;
use valpipe_core::store::{PipelineStore, RunTicket, StoreChange};
use valpipe_core::view::PipelineView;
use valpipe_core::wire::{ClientMsg, PipelineMsg};
use valpipe_core::{PipelineResult, SessionId};

const COMMAND_QUEUE: usize = 64;
const CHANNEL_QUEUE: usize = 512;
const REQUEST_QUEUE: usize = 8;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor has stopped")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    OpenSession(SessionId),
    ClearSession,
    StartRun { prompts: BTreeMap<String, String> },
    UpdatePrompt { agent: String, prompt: String },
    Shutdown,
}

/// Handle to the monitor task. All state lives on that task; the handle only
/// sends commands and hands out view subscriptions.
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCommand>,
    view: watch::Receiver<PipelineView>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn spawn(config: MonitorConfig, api: Arc<dyn PipelineApi>, connector: Arc<dyn Connector>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (channel_tx, channel_rx) = mpsc::channel(CHANNEL_QUEUE);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (view_tx, view_rx) = watch::channel(PipelineView::default());

        let store = PipelineStore::new(config.roster.clone());
        let simulator = FallbackSimulator::new(store.roster().len());
        let manager = ConnectionManager::new(connector, config.reconnect, channel_tx);
        let monitor = Monitor {
            config,
            api,
            manager,
            store,
            simulator,
            clock: ElapsedClock::new(),
            sim_deadline: None,
            requests: request_tx,
            view: view_tx,
        };
        monitor.publish();
        let task = tokio::spawn(monitor.run(command_rx, channel_rx, request_rx));
        Self {
            commands: command_tx,
            view: view_rx,
            task,
        }
    }

    /// Replaces the active session. Everything owned by the previous one is
    /// dropped before the new connection opens.
    pub async fn open_session(&self, session: SessionId) -> Result<(), MonitorError> {
        self.send(MonitorCommand::OpenSession(session)).await
    }

    pub async fn clear_session(&self) -> Result<(), MonitorError> {
        self.send(MonitorCommand::ClearSession).await
    }

    /// Fires the start request and starts the clock. The request is not
    /// awaited; its outcome arrives through the view.
    pub async fn start_run(&self, prompts: BTreeMap<String, String>) -> Result<(), MonitorError> {
        self.send(MonitorCommand::StartRun { prompts }).await
    }

    pub async fn update_prompt(
        &self,
        agent: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<(), MonitorError> {
        self.send(MonitorCommand::UpdatePrompt {
            agent: agent.into(),
            prompt: prompt.into(),
        })
        .await
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineView> {
        self.view.clone()
    }

    pub fn current(&self) -> PipelineView {
        self.view.borrow().clone()
    }

    /// Resolves with the latched result of the active session.
    pub async fn wait_for_result(&self) -> Result<PipelineResult, MonitorError> {
        let mut view = self.view.clone();
        let latched = view
            .wait_for(|view| view.result.is_some())
            .await
            .map_err(|_| MonitorError::Stopped)?;
        latched.result.clone().ok_or(MonitorError::Stopped)
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(MonitorCommand::Shutdown).await;
        if let Err(err) = self.task.await {
            if err.is_panic() {
                error!(event = "monitor_panicked", error = %err);
            }
        }
    }

    async fn send(&self, command: MonitorCommand) -> Result<(), MonitorError> {
        self.commands.send(command).await.map_err(|_| MonitorError::Stopped)
    }
}

struct RequestEvent {
    ticket: RunTicket,
    outcome: Result<PipelineResult, ApiError>,
}

struct Monitor {
    config: MonitorConfig,
    api: Arc<dyn PipelineApi>,
    manager: ConnectionManager,
    store: PipelineStore,
    simulator: FallbackSimulator,
    clock: ElapsedClock,
    sim_deadline: Option<Instant>,
    requests: mpsc::Sender<RequestEvent>,
    view: watch::Sender<PipelineView>,
}

impl Monitor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<MonitorCommand>,
        mut channel: mpsc::Receiver<ChannelEvent>,
        mut requests: mpsc::Receiver<RequestEvent>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.sim_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(MonitorCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = channel.recv() => self.handle_channel(event),
                Some(event) = requests.recv() => self.handle_request(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.advance_simulation();
                }
                _ = ticker.tick(), if self.clock.is_running() => {}
            }
            self.publish();
        }

        self.manager.disconnect();
        info!(event = "monitor_stopped");
    }

    fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::OpenSession(session) => {
                self.manager.disconnect();
                self.store.open_session(session.clone());
                self.reset_run_local();
                match self.config.channel_url(&session) {
                    Ok(url) => {
                        info!(event = "session_opened", session = %session, url = %url);
                        self.manager.connect(session, url);
                    }
                    Err(err) => {
                        error!(event = "channel_url_invalid", session = %session, error = %err);
                    }
                }
            }
            MonitorCommand::ClearSession => {
                self.manager.disconnect();
                self.store.clear_session();
                self.reset_run_local();
                info!(event = "session_cleared");
            }
            MonitorCommand::StartRun { prompts } => self.start_run(prompts),
            MonitorCommand::UpdatePrompt { agent, prompt } => {
                let msg = ClientMsg::UpdatePrompt {
                    agent: agent.clone(),
                    prompt,
                };
                match self.manager.send(&msg) {
                    Ok(()) => info!(event = "prompt_update_sent", agent = %agent),
                    Err(err) => warn!(event = "prompt_update_dropped", agent = %agent, error = %err),
                }
            }
            MonitorCommand::Shutdown => {}
        }
    }

    fn start_run(&mut self, prompts: BTreeMap<String, String>) {
        let Some(ticket) = self.store.begin_run() else {
            warn!(event = "run_without_session");
            return;
        };
        self.simulator.reset(self.store.roster().len());
        self.sim_deadline = None;
        self.clock.start(now());
        info!(
            event = "run_started",
            session = %ticket.session,
            run = ticket.generation,
            prompts = prompts.len()
        );

        let api = self.api.clone();
        let requests = self.requests.clone();
        tokio::spawn(async move {
            let outcome = api.start_pipeline(&ticket.session, &prompts).await;
            let _ = requests.send(RequestEvent { ticket, outcome }).await;
        });
        self.refresh_simulation();
    }

    fn handle_channel(&mut self, event: ChannelEvent) {
        // queued by a connection that has since been torn down
        if !self.manager.is_current(event.epoch()) {
            debug!(event = "stale_channel_event", epoch = event.epoch());
            return;
        }
        match event {
            ChannelEvent::State { session, state, .. } => {
                if self.store.set_connection(&session, state) {
                    debug!(event = "connection_state", session = %session, state = %state);
                }
            }
            ChannelEvent::Frame { session, frame, .. } => {
                let msg = match frame.decode() {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!(event = "decode_dropped", session = %session, error = %err);
                        return;
                    }
                };
                if let PipelineMsg::PromptUpdated(ack) = &msg {
                    info!(event = "prompt_updated", agent = %ack.agent);
                }
                let kind = msg.kind();
                match self.store.apply(&session, msg) {
                    StoreChange::StaleSession => {
                        debug!(event = "stale_frame", session = %session, kind = kind);
                        return;
                    }
                    StoreChange::RunStarted { agents } => {
                        self.simulator.set_roster_len(agents);
                        info!(event = "pipeline_started", session = %session, agents = agents);
                    }
                    StoreChange::StatusChanged { agent, status } => {
                        debug!(event = "agent_status", agent = %agent, status = %status);
                    }
                    StoreChange::Completed(outcome) => {
                        self.on_completion(CompletionSource::Stream, outcome);
                    }
                    StoreChange::LogAppended { .. } | StoreChange::Unchanged => {}
                }
                self.refresh_simulation();
            }
        }
    }

    fn handle_request(&mut self, event: RequestEvent) {
        let RequestEvent { ticket, outcome } = event;
        match outcome {
            Ok(result) => match self.store.offer_result(&ticket, CompletionSource::Request, result) {
                Some(outcome) => self.on_completion(CompletionSource::Request, outcome),
                None => debug!(event = "stale_request_result", session = %ticket.session, run = ticket.generation),
            },
            Err(err) => {
                warn!(event = "start_request_failed", session = %ticket.session, error = %err);
                self.store.record_error(&ticket, err.to_string());
            }
        }
        self.refresh_simulation();
    }

    fn on_completion(&mut self, source: CompletionSource, outcome: LatchOutcome) {
        match outcome {
            LatchOutcome::Adopted => {
                self.clock.stop(now());
                self.sim_deadline = None;
                info!(event = "result_latched", source = %source);
            }
            LatchOutcome::Discarded { holder } => {
                info!(event = "result_discarded", source = %source, holder = %holder);
            }
        }
    }

    fn advance_simulation(&mut self) {
        self.sim_deadline = None;
        if self.simulator.tick() {
            debug!(event = "simulation_advanced", pointer = self.simulator.pointer().unwrap_or_default());
        }
        self.refresh_simulation();
    }

    /// Re-evaluates engagement and keeps exactly one stage deadline pending
    /// while the pointer can still move.
    fn refresh_simulation(&mut self) {
        let engaged = self
            .simulator
            .observe(self.store.statuses(), self.store.started_by_user());
        let keep_running = engaged
            && self.store.run_active()
            && !self.store.has_result()
            && self.simulator.can_advance();
        if !keep_running {
            self.sim_deadline = None;
        } else if self.sim_deadline.is_none() {
            self.sim_deadline = Some(Instant::now() + self.config.sim_interval);
        }
    }

    fn reset_run_local(&mut self) {
        self.simulator.reset(self.store.roster().len());
        self.sim_deadline = None;
        self.clock.reset();
    }

    fn publish(&self) {
        let next = PipelineView::derive(&self.store, &self.simulator, &self.clock, now());
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
