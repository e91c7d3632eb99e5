use crate::config::ReconnectPolicy;
use async_trait::async_trait;
use futures_util::sink::Sink;
use futures_util::stream::BoxStream;
use futures_util::{future, SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use valpipe_core::wire::{
    decode_message, decode_message_bytes, encode_client_message, ClientMsg, FrameError, PipelineMsg,
};
use valpipe_core::{ConnectionState, SessionId};

const OUTBOUND_QUEUE: usize = 32;
/// How long a torn-down worker gets to send its close frame before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel is not connected")]
    NotConnected,
    #[error("outbound queue is full")]
    QueueFull,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A data frame as received. Binary frames are decoded as UTF-8 JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl InboundFrame {
    pub fn decode(&self) -> Result<PipelineMsg, FrameError> {
        match self {
            InboundFrame::Text(text) => decode_message(text),
            InboundFrame::Binary(bytes) => decode_message_bytes(bytes),
        }
    }
}

impl From<String> for InboundFrame {
    fn from(text: String) -> Self {
        InboundFrame::Text(text)
    }
}

pub type InboundStream = BoxStream<'static, Result<InboundFrame, ChannelError>>;
pub type OutboundSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;

/// One open streaming connection, reduced to data frames in both directions.
pub struct Channel {
    pub inbound: InboundStream,
    pub outbound: OutboundSink,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Channel, ChannelError>;
}

/// Websocket transport. Text and binary frames pass through, control frames
/// are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Channel, ChannelError> {
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (sink, stream) = ws.split();
        let inbound = stream
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text))),
                    Ok(Message::Binary(bytes)) => Some(Ok(InboundFrame::Binary(bytes))),
                    Ok(_) => None,
                    Err(err) => Some(Err(ChannelError::Transport(err.to_string()))),
                })
            })
            .boxed();
        let outbound = sink
            .sink_map_err(|err| ChannelError::Transport(err.to_string()))
            .with(|text: String| future::ready(Ok::<_, ChannelError>(Message::Text(text))));
        Ok(Channel {
            inbound,
            outbound: Box::pin(outbound),
        })
    }
}

/// Everything the channel reports, stamped with the session it belongs to and
/// the epoch of the connection that produced it. Every `connect` opens a new
/// epoch, so a session reopened under the same id still rejects leftovers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    State {
        session: SessionId,
        epoch: u64,
        state: ConnectionState,
    },
    Frame {
        session: SessionId,
        epoch: u64,
        frame: InboundFrame,
    },
}

impl ChannelEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            ChannelEvent::State { epoch, .. } | ChannelEvent::Frame { epoch, .. } => *epoch,
        }
    }
}

struct Worker {
    session: SessionId,
    epoch: u64,
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

/// Owns the streaming connection for the active session and keeps it open,
/// reconnecting for as long as that session stays active.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    events: mpsc::Sender<ChannelEvent>,
    active: watch::Sender<Option<u64>>,
    next_epoch: u64,
    worker: Option<Worker>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            connector,
            policy,
            events,
            active,
            next_epoch: 0,
            worker: None,
        }
    }

    /// Tears down any previous connection, then starts one for `session`.
    pub fn connect(&mut self, session: SessionId, url: Url) {
        self.disconnect();
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.active.send_replace(Some(epoch));

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let task = ChannelTask {
            connector: self.connector.clone(),
            policy: self.policy,
            url,
            session: session.clone(),
            epoch,
            events: self.events.clone(),
            active: self.active.subscribe(),
            state: state_tx,
            outbound: outbound_rx,
        };
        let handle = tokio::spawn(task.run());
        self.worker = Some(Worker {
            session,
            epoch,
            outbound: outbound_tx,
            state: state_rx,
            task: handle,
        });
    }

    /// Closes the connection and cancels any pending reconnect. The worker
    /// sees the change at once and sends its close frame; it is aborted if
    /// that takes longer than the grace period.
    pub fn disconnect(&mut self) {
        self.active.send_replace(None);
        if let Some(worker) = self.worker.take() {
            info!(event = "channel_teardown", session = %worker.session, epoch = worker.epoch);
            reap(worker.task);
        }
    }

    /// Queues a message on the open connection. Fails when nothing is open.
    pub fn send(&self, msg: &ClientMsg) -> Result<(), ChannelError> {
        let worker = self.worker.as_ref().ok_or(ChannelError::NotConnected)?;
        if *worker.state.borrow() != ConnectionState::Connected {
            return Err(ChannelError::NotConnected);
        }
        let text = encode_client_message(msg)?;
        worker.outbound.try_send(text).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ChannelError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ChannelError::NotConnected,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.worker
            .as_ref()
            .map(|worker| *worker.state.borrow())
            .unwrap_or_default()
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.worker.as_ref().map(|worker| &worker.session)
    }

    /// True when `epoch` belongs to the connection that is open now.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.worker.as_ref().is_some_and(|worker| worker.epoch == epoch)
    }
}

fn reap(mut task: JoinHandle<()>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if timeout(CLOSE_GRACE, &mut task).await.is_err() {
                    task.abort();
                }
            });
        }
        Err(_) => task.abort(),
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct ChannelTask {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    url: Url,
    session: SessionId,
    epoch: u64,
    events: mpsc::Sender<ChannelEvent>,
    active: watch::Receiver<Option<u64>>,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::Receiver<String>,
}

enum PumpExit {
    Dropped,
    Stop,
}

impl ChannelTask {
    async fn run(mut self) {
        let mut delay = self.policy.initial;
        loop {
            if !self.is_active() {
                break;
            }
            if !self.publish(ConnectionState::Connecting).await {
                break;
            }
            let connect = tokio::select! {
                result = self.connector.connect(&self.url) => result,
                _ = superseded(&mut self.active, self.epoch) => break,
            };
            match connect {
                Ok(channel) => {
                    delay = self.policy.initial;
                    self.discard_queued();
                    if !self.publish(ConnectionState::Connected).await {
                        break;
                    }
                    info!(event = "channel_connected", session = %self.session, url = %self.url);
                    if let PumpExit::Stop = self.pump(channel).await {
                        break;
                    }
                    warn!(
                        event = "channel_dropped",
                        session = %self.session,
                        retry_in_ms = delay.as_millis() as u64
                    );
                }
                Err(err) => {
                    warn!(
                        event = "channel_connect_failed",
                        session = %self.session,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64
                    );
                }
            }
            if !self.publish(ConnectionState::Disconnected).await {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = superseded(&mut self.active, self.epoch) => break,
            }
            // the connection may have been replaced while we slept
            if !self.is_active() {
                break;
            }
            delay = self.policy.next(delay);
        }
        self.state.send_replace(ConnectionState::Disconnected);
        debug!(event = "channel_task_exit", session = %self.session);
    }

    async fn pump(&mut self, channel: Channel) -> PumpExit {
        let Channel {
            mut inbound,
            mut outbound,
        } = channel;
        let mut outbound_open = true;
        loop {
            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(Ok(frame)) => {
                        let event = ChannelEvent::Frame {
                            session: self.session.clone(),
                            epoch: self.epoch,
                            frame,
                        };
                        if self.events.send(event).await.is_err() {
                            return PumpExit::Stop;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(event = "channel_read_error", session = %self.session, error = %err);
                        return PumpExit::Dropped;
                    }
                    None => return PumpExit::Dropped,
                },
                out = self.outbound.recv(), if outbound_open => match out {
                    Some(text) => {
                        if let Err(err) = outbound.send(text).await {
                            warn!(event = "channel_write_error", session = %self.session, error = %err);
                            return PumpExit::Dropped;
                        }
                    }
                    None => outbound_open = false,
                },
                _ = superseded(&mut self.active, self.epoch) => {
                    match timeout(CLOSE_GRACE, outbound.close()).await {
                        Ok(Ok(())) => debug!(event = "channel_closed", session = %self.session),
                        Ok(Err(err)) => debug!(event = "channel_close_failed", session = %self.session, error = %err),
                        Err(_) => debug!(event = "channel_close_timeout", session = %self.session),
                    }
                    return PumpExit::Stop;
                }
            }
        }
    }

    fn is_active(&self) -> bool {
        *self.active.borrow() == Some(self.epoch)
    }

    /// Messages queued while the previous connection was going down are not
    /// replayed.
    fn discard_queued(&mut self) {
        while let Ok(text) = self.outbound.try_recv() {
            warn!(event = "outbound_dropped", session = %self.session, bytes = text.len());
        }
    }

    async fn publish(&self, state: ConnectionState) -> bool {
        self.state.send_replace(state);
        let event = ChannelEvent::State {
            session: self.session.clone(),
            epoch: self.epoch,
            state,
        };
        self.events.send(event).await.is_ok()
    }
}

/// Resolves once `epoch` is no longer the active connection.
async fn superseded(active: &mut watch::Receiver<Option<u64>>, epoch: u64) {
    loop {
        if *active.borrow_and_update() != Some(epoch) {
            return;
        }
        if active.changed().await.is_err() {
            return;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Script, ScriptedConnector};
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn url() -> Url {
        Url::parse("ws://127.0.0.1:8000/ws/pipeline/s-1").expect("url")
    }

    fn offsets(t0: Instant, attempts: &[Instant]) -> Vec<u64> {
        attempts
            .iter()
            .map(|at| at.duration_since(t0).as_secs())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_two_seconds_after_a_drop() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::open_for(Duration::from_secs(3)),
            Script::open_forever(Vec::new()),
        ]));
        let (tx, _rx) = mpsc::channel(64);
        let mut manager = ConnectionManager::new(
            connector.clone(),
            ReconnectPolicy::fixed(Duration::from_secs(2)),
            tx,
        );
        let t0 = Instant::now();
        manager.connect(SessionId::from("s-1"), url());
        sleep(Duration::from_secs(30)).await;

        assert_eq!(offsets(t0, &connector.attempts()), vec![0, 5]);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_the_session_cancels_a_pending_reconnect() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::open_for(Duration::from_secs(3))]));
        let (tx, _rx) = mpsc::channel(64);
        let mut manager = ConnectionManager::new(
            connector.clone(),
            ReconnectPolicy::fixed(Duration::from_secs(2)),
            tx,
        );
        let t0 = Instant::now();
        manager.connect(SessionId::from("s-1"), url());
        sleep(Duration::from_secs(4)).await;
        manager.disconnect();
        sleep(Duration::from_secs(120)).await;

        assert_eq!(offsets(t0, &connector.attempts()), vec![0]);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_back_off_up_to_the_ceiling() {
        let connector = Arc::new(ScriptedConnector::new(Vec::new()));
        let (tx, _rx) = mpsc::channel(256);
        let mut manager = ConnectionManager::new(
            connector.clone(),
            ReconnectPolicy {
                initial: Duration::from_secs(2),
                max: Duration::from_secs(8),
            },
            tx,
        );
        let t0 = Instant::now();
        manager.connect(SessionId::from("s-1"), url());
        sleep(Duration::from_secs(31)).await;

        assert_eq!(offsets(t0, &connector.attempts()), vec![0, 2, 6, 14, 22, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_and_states_are_stamped_with_session_and_epoch() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::open_forever(Vec::new()),
            Script::open_forever(vec![r#"{"type":"agent_status","agent":"A","status":"queued"}"#.to_string()]),
        ]));
        let (tx, mut rx) = mpsc::channel(64);
        let mut manager = ConnectionManager::new(connector, ReconnectPolicy::default(), tx);
        let sid = SessionId::from("s-1");
        manager.connect(sid.clone(), url());
        sleep(Duration::from_millis(10)).await;
        manager.connect(sid.clone(), url());
        sleep(Duration::from_millis(10)).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                ChannelEvent::State {
                    session: sid.clone(),
                    epoch: 1,
                    state: ConnectionState::Connecting
                },
                ChannelEvent::State {
                    session: sid.clone(),
                    epoch: 1,
                    state: ConnectionState::Connected
                },
                ChannelEvent::State {
                    session: sid.clone(),
                    epoch: 2,
                    state: ConnectionState::Connecting
                },
                ChannelEvent::State {
                    session: sid.clone(),
                    epoch: 2,
                    state: ConnectionState::Connected
                },
                ChannelEvent::Frame {
                    session: sid,
                    epoch: 2,
                    frame: InboundFrame::Text(
                        r#"{"type":"agent_status","agent":"A","status":"queued"}"#.to_string()
                    )
                },
            ]
        );
        assert!(!manager.is_current(1));
        assert!(manager.is_current(2));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_the_open_connection() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::open_forever(Vec::new())]));
        let (tx, _rx) = mpsc::channel(64);
        let mut manager = ConnectionManager::new(connector.clone(), ReconnectPolicy::default(), tx);
        manager.connect(SessionId::from("s-1"), url());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.closed(), 0);

        manager.disconnect();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.closed(), 1);
        assert!(!manager.is_current(1));
    }

    #[test]
    fn binary_frames_decode_as_utf8_json() {
        let frame = InboundFrame::Binary(br#"{"type":"prompt_updated","agent":"Guardian"}"#.to_vec());
        assert!(matches!(frame.decode(), Ok(PipelineMsg::PromptUpdated(_))));
        assert!(matches!(
            InboundFrame::Binary(vec![0xff, 0xfe]).decode(),
            Err(FrameError::InvalidUtf8)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_reaches_the_open_connection_only() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::open_forever(Vec::new())]));
        let (tx, _rx) = mpsc::channel(64);
        let mut manager = ConnectionManager::new(connector.clone(), ReconnectPolicy::default(), tx);
        let msg = ClientMsg::UpdatePrompt {
            agent: "Guardian".to_string(),
            prompt: "Be brief.".to_string(),
        };
        assert!(matches!(manager.send(&msg), Err(ChannelError::NotConnected)));

        manager.connect(SessionId::from("s-1"), url());
        sleep(Duration::from_millis(10)).await;
        manager.send(&msg).expect("send");
        sleep(Duration::from_millis(10)).await;

        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(r#""type":"update_prompt""#));

        manager.disconnect();
        assert!(matches!(manager.send(&msg), Err(ChannelError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_sessions_replaces_the_worker() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::open_forever(Vec::new()),
            Script::open_forever(Vec::new()),
        ]));
        let (tx, _rx) = mpsc::channel(64);
        let mut manager = ConnectionManager::new(connector.clone(), ReconnectPolicy::default(), tx);
        manager.connect(SessionId::from("s-1"), url());
        sleep(Duration::from_millis(10)).await;
        manager.connect(SessionId::from("s-2"), url());
        sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(manager.session(), Some(&SessionId::from("s-2")));
    }
}
