//! Connection Manager
//!
//! Owns the active transport and its lifecycle: handshake, heartbeat,
//! reconnect with exponential backoff, and escalation along the fallback
//! chain. Runs as a single task; callers talk to it through a handle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::transcript::TranscriptionEvent;

use super::backoff::ExponentialBackoff;
use super::fallback::{FailureOutcome, FallbackCoordinator};
use super::protocol::{ClientMessage, ServerMessage};
use super::transport::{Transport, TransportError, TransportFactory, TransportKind};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Streaming,
    Reconnecting,
    Closing,
    Closed,
    Error,
}

/// Connection-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("handshake not acknowledged within the connect timeout")]
    ConnectTimeout,

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("protocol rejected by backend: {code} {message}")]
    ProtocolRejected { code: u16, message: String },

    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    #[error("not connected")]
    NotConnected,

    #[error("connection failed permanently: {0}")]
    Fatal(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outbound message priority. Governs what is replayed after a transport
/// switch: control and audio messages are replayed, low-priority messages
/// are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendPriority {
    Control,
    Audio,
    Low,
}

/// Events published by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    TransportChanged(TransportKind),
    Transcription(TranscriptionEvent),
    Fatal(SessionFailure),
}

/// Terminal failure report, carrying the diagnostics the session had when
/// it gave up.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFailure {
    pub reason: String,
    /// State the connection was in when the failure became terminal.
    pub last_state: ConnectionState,
    /// Reconnect attempts since the last successful handshake.
    pub retry_count: u32,
}

/// Snapshot of the managed connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSession {
    /// Locally generated session identity.
    pub id: Uuid,
    pub state: ConnectionState,
    /// Transport currently selected in the fallback chain.
    pub transport: TransportKind,
    /// Reconnect attempts since the last successful handshake.
    pub retry_count: u32,
    /// Backend-assigned session token, when the backend supplies one.
    pub remote_session: Option<String>,
}

enum Command {
    Send {
        message: ClientMessage,
        priority: SendPriority,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    session: RwLock<ConnectionSession>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        {
            let mut session = self.session.write();
            if session.state == state {
                return;
            }
            tracing::debug!("connection state {:?} -> {:?}", session.state, state);
            session.state = state;
        }
        let _ = self.event_tx.send(ConnectionEvent::StateChanged(state));
    }

    fn state(&self) -> ConnectionState {
        self.session.read().state
    }
}

/// Handle to the connection task.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    command_tx: mpsc::UnboundedSender<Command>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Spawn the connection task and start connecting immediately.
    ///
    /// Returns the handle and the event stream. The caller owns the event
    /// receiver; dropping it does not stop the connection.
    pub fn start(
        config: SessionConfig,
        factory: TransportFactory,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            session: RwLock::new(ConnectionSession {
                id: Uuid::new_v4(),
                state: ConnectionState::Disconnected,
                transport: config.transports[0],
                retry_count: 0,
                remote_session: None,
            }),
            event_tx,
        });

        let task = tokio::spawn(run(config, factory, shared.clone(), command_rx));

        (
            Self {
                shared,
                command_tx,
                task: parking_lot::Mutex::new(Some(task)),
            },
            event_rx,
        )
    }

    /// Queue one message for the active transport.
    ///
    /// Control and audio messages are accepted in any live state; while
    /// the connection is down they are buffered and replayed once the
    /// handshake completes. Low-priority messages outside the streaming
    /// state fail fast with [`ConnectionError::NotConnected`], as does
    /// any send once the connection task is gone.
    pub fn send(
        &self,
        message: ClientMessage,
        priority: SendPriority,
    ) -> Result<(), ConnectionError> {
        if priority == SendPriority::Low && self.shared.state() != ConnectionState::Streaming {
            return Err(ConnectionError::NotConnected);
        }
        self.command_tx
            .send(Command::Send { message, priority })
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Current connection snapshot.
    pub fn session(&self) -> ConnectionSession {
        self.shared.session.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Gracefully close: send `end`, close the transport, stop the task.
    /// Idempotent; a second call returns once the task is gone.
    pub async fn disconnect(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Disconnect { done: done_tx })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Why the streaming loop ended.
enum StreamEnd {
    /// Caller asked for a graceful close.
    Disconnected(oneshot::Sender<()>),
    /// Channel dropped; reconnect on the same transport.
    Retry(ConnectionError),
    /// Fallback coordinator crossed the threshold.
    Escalate(TransportKind),
    /// No recovery possible.
    Fatal(ConnectionError),
}

struct Runner {
    config: SessionConfig,
    factory: TransportFactory,
    shared: Arc<Shared>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    backoff: ExponentialBackoff,
    fallback: FallbackCoordinator,
    /// Messages awaiting replay after a reconnect or transport switch.
    replay: VecDeque<(SendPriority, ClientMessage)>,
    ping_seq: u64,
    pong_seq: u64,
}

async fn run(
    config: SessionConfig,
    factory: TransportFactory,
    shared: Arc<Shared>,
    command_rx: mpsc::UnboundedReceiver<Command>,
) {
    let backoff = ExponentialBackoff::new(config.backoff.clone());
    let fallback = FallbackCoordinator::new(config.transports.clone(), config.escalation_threshold);
    let mut runner = Runner {
        config,
        factory,
        shared,
        command_rx,
        backoff,
        fallback,
        replay: VecDeque::new(),
        ping_seq: 0,
        pong_seq: 0,
    };
    runner.run().await;
}

impl Runner {
    async fn run(&mut self) {
        loop {
            let kind = self.fallback.active();
            self.shared.session.write().transport = kind;

            let mut transport = match self.connect(kind).await {
                Ok(transport) => transport,
                Err(ConnectPhase::Disconnect(done)) => {
                    self.shared.set_state(ConnectionState::Closed);
                    let _ = done.send(());
                    return;
                }
                Err(ConnectPhase::Fatal(err)) => {
                    self.fail(err);
                    return;
                }
                Err(ConnectPhase::Retry(err)) => {
                    if !self.wait_backoff(&err).await {
                        return;
                    }
                    continue;
                }
            };

            // Fresh handshake succeeded.
            self.backoff.reset();
            self.fallback.reset();
            self.shared.session.write().retry_count = 0;
            self.shared.set_state(ConnectionState::Streaming);
            if let Err(err) = self.drain_replay(&mut *transport).await {
                tracing::warn!("replay failed, reconnecting: {}", err);
                transport.close().await;
                if !self.wait_backoff(&err).await {
                    return;
                }
                continue;
            }

            match self.stream(&mut *transport).await {
                StreamEnd::Disconnected(done) => {
                    self.shared.set_state(ConnectionState::Closing);
                    let _ = transport.send(&ClientMessage::End).await;
                    transport.close().await;
                    self.shared.set_state(ConnectionState::Closed);
                    let _ = done.send(());
                    return;
                }
                StreamEnd::Retry(err) => {
                    transport.close().await;
                    if !self.wait_backoff(&err).await {
                        return;
                    }
                }
                StreamEnd::Escalate(next) => {
                    transport.close().await;
                    tracing::warn!("escalating transport {} -> {}", kind, next);
                    let _ = self
                        .shared
                        .event_tx
                        .send(ConnectionEvent::TransportChanged(next));
                    // Switch immediately; backoff only governs retries of
                    // the transport now active.
                    self.backoff.reset();
                }
                StreamEnd::Fatal(err) => {
                    transport.close().await;
                    self.fail(err);
                    return;
                }
            }
        }
    }

    /// Publish the terminal failure and park in the error state.
    fn fail(&self, err: ConnectionError) {
        let (last_state, retry_count) = {
            let session = self.shared.session.read();
            (session.state, session.retry_count)
        };
        tracing::error!("connection failed permanently: {}", err);
        self.shared.set_state(ConnectionState::Error);
        let _ = self.shared.event_tx.send(ConnectionEvent::Fatal(SessionFailure {
            reason: err.to_string(),
            last_state,
            retry_count,
        }));
    }

    /// Sleep one backoff delay, still answering disconnects. Returns false
    /// when the task should stop.
    async fn wait_backoff(&mut self, err: &ConnectionError) -> bool {
        if self.backoff.exhausted() {
            self.fail(ConnectionError::Fatal(format!(
                "gave up after {} attempts: {err}",
                self.backoff.attempt()
            )));
            return false;
        }

        self.shared.set_state(ConnectionState::Reconnecting);
        let delay = self.backoff.next_delay();
        self.shared.session.write().retry_count = self.backoff.attempt();
        tracing::info!(
            "reconnecting in {:?} (attempt {}): {}",
            delay,
            self.backoff.attempt(),
            err
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::Disconnect { done }) => {
                        self.shared.set_state(ConnectionState::Closed);
                        let _ = done.send(());
                        return false;
                    }
                    Some(Command::Send { message, priority }) => {
                        self.buffer_for_replay(priority, message);
                    }
                    None => {
                        self.shared.set_state(ConnectionState::Closed);
                        return false;
                    }
                },
            }
        }
    }

    fn buffer_for_replay(&mut self, priority: SendPriority, message: ClientMessage) {
        if priority == SendPriority::Low {
            tracing::debug!("dropping low-priority message while disconnected");
            return;
        }
        self.replay.push_back((priority, message));
    }

    /// Connect and complete the setup handshake on one transport.
    async fn connect(&mut self, kind: TransportKind) -> Result<Box<dyn Transport>, ConnectPhase> {
        self.shared.set_state(ConnectionState::Connecting);
        let mut transport = (self.factory)(kind);

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let shared = self.shared.clone();
        let setup = ClientMessage::Setup {
            api_key: self.config.credentials.api_key.clone(),
            sample_rate: self.config.audio.sample_rate,
            channels: self.config.audio.channels,
        };
        let handshake = async {
            transport.connect().await?;
            shared.set_state(ConnectionState::Handshaking);
            transport.send(&setup).await?;

            // Audio must not flow until the backend acknowledges setup.
            loop {
                match transport.recv().await? {
                    Some(ServerMessage::SetupAck { session }) => return Ok(session),
                    Some(ServerMessage::Error { code, message }) => {
                        return Err(if code == 401 || code == 403 {
                            TransportError::Auth(message)
                        } else {
                            TransportError::Connect(format!("{code} {message}"))
                        });
                    }
                    Some(other) => {
                        tracing::warn!("ignoring pre-ack message: {:?}", other);
                    }
                    None => return Err(TransportError::Closed("closed during handshake".into())),
                }
            }
        };

        // Commands arriving mid-connect are buffered for replay; only a
        // disconnect interrupts the attempt.
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, handshake) => result,
            cmd = wait_disconnect(&mut self.command_rx, &mut self.replay) => {
                return Err(ConnectPhase::Disconnect(cmd));
            }
        };

        match result {
            Ok(Ok(session)) => {
                if let Some(token) = &session {
                    tracing::info!("handshake complete, backend session {}", token);
                }
                self.shared.session.write().remote_session = session;
                Ok(transport)
            }
            Ok(Err(TransportError::Auth(reason))) => {
                Err(ConnectPhase::Fatal(ConnectionError::AuthFailure(reason)))
            }
            Ok(Err(err)) => Err(ConnectPhase::Retry(err.into())),
            Err(_) => Err(ConnectPhase::Retry(ConnectionError::ConnectTimeout)),
        }
    }

    /// Replay buffered messages, control before audio, in queue order.
    async fn drain_replay(&mut self, transport: &mut dyn Transport) -> Result<(), ConnectionError> {
        if self.replay.is_empty() {
            return Ok(());
        }
        tracing::info!("replaying {} buffered messages", self.replay.len());
        let queued = std::mem::take(&mut self.replay);
        let (control, rest): (VecDeque<_>, VecDeque<_>) = queued
            .into_iter()
            .partition(|(priority, _)| *priority == SendPriority::Control);
        for (_, message) in control.into_iter().chain(rest) {
            transport.send(&message).await?;
        }
        Ok(())
    }

    /// The streaming loop: commands out, server messages in, heartbeats on
    /// a timer.
    async fn stream(&mut self, transport: &mut dyn Transport) -> StreamEnd {
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat.interval_ms));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // immediate first tick
        let mut missed: u32 = 0;
        // Pings from a previous connection can never be acknowledged.
        self.pong_seq = self.ping_seq;

        loop {
            let event = {
                let recv = transport.recv();
                tokio::pin!(recv);
                tokio::select! {
                    cmd = self.command_rx.recv() => Loop::Command(cmd),
                    result = &mut recv => Loop::Inbound(result),
                    _ = heartbeat.tick() => Loop::Heartbeat,
                }
            };

            match event {
                Loop::Command(None) => {
                    // All handles dropped; treat as a disconnect without a
                    // completion signal.
                    let (done, _) = oneshot::channel();
                    return StreamEnd::Disconnected(done);
                }
                Loop::Command(Some(Command::Disconnect { done })) => {
                    return StreamEnd::Disconnected(done);
                }
                Loop::Command(Some(Command::Send { message, priority })) => {
                    if let Err(err) = transport.send(&message).await {
                        self.buffer_for_replay(priority, message);
                        return StreamEnd::Retry(err.into());
                    }
                }
                Loop::Inbound(Ok(Some(message))) => {
                    if let Some(end) = self.on_server_message(message, &mut missed) {
                        return end;
                    }
                }
                Loop::Inbound(Ok(None)) => {
                    tracing::info!("backend closed the stream");
                    return StreamEnd::Retry(ConnectionError::Transport(TransportError::Closed(
                        "remote close".into(),
                    )));
                }
                Loop::Inbound(Err(err)) => {
                    return StreamEnd::Retry(err.into());
                }
                Loop::Heartbeat => {
                    if self.ping_seq > self.pong_seq {
                        missed += 1;
                        tracing::warn!(
                            "heartbeat ack missing ({}/{})",
                            missed,
                            self.config.heartbeat.max_missed
                        );
                        if missed >= self.config.heartbeat.max_missed {
                            return StreamEnd::Retry(ConnectionError::HeartbeatTimeout);
                        }
                    } else {
                        missed = 0;
                    }
                    self.ping_seq += 1;
                    let ping = ClientMessage::Ping { seq: self.ping_seq };
                    if let Err(err) = transport.send(&ping).await {
                        return StreamEnd::Retry(err.into());
                    }
                }
            }
        }
    }

    fn on_server_message(&mut self, message: ServerMessage, missed: &mut u32) -> Option<StreamEnd> {
        match message {
            ServerMessage::Partial {
                utterance_id,
                text,
                confidence,
                seq,
            } => {
                self.emit_transcription(utterance_id, text, false, confidence, seq);
                None
            }
            ServerMessage::Final {
                utterance_id,
                text,
                confidence,
                seq,
            } => {
                self.emit_transcription(utterance_id, text, true, confidence, seq);
                None
            }
            ServerMessage::Pong { seq } => {
                self.pong_seq = self.pong_seq.max(seq);
                *missed = 0;
                None
            }
            ServerMessage::SetupAck { .. } => None, // duplicate ack, harmless
            ServerMessage::Error { code, message } => {
                if code == 401 || code == 403 {
                    return Some(StreamEnd::Fatal(ConnectionError::AuthFailure(message)));
                }
                tracing::warn!("backend error {}: {}", code, message);
                let kind = self.fallback.active();
                match self.fallback.record_failure(kind) {
                    FailureOutcome::Tolerated => None,
                    FailureOutcome::Escalated(next) => Some(StreamEnd::Escalate(next)),
                    FailureOutcome::Exhausted => {
                        Some(StreamEnd::Fatal(ConnectionError::ProtocolRejected {
                            code,
                            message,
                        }))
                    }
                }
            }
        }
    }

    fn emit_transcription(
        &self,
        utterance_id: Option<String>,
        text: String,
        is_final: bool,
        confidence: Option<f32>,
        seq: u64,
    ) {
        let _ = self
            .shared
            .event_tx
            .send(ConnectionEvent::Transcription(TranscriptionEvent {
                utterance_id,
                text,
                is_final,
                confidence,
                seq,
            }));
    }
}

enum Loop {
    Command(Option<Command>),
    Inbound(Result<Option<ServerMessage>, TransportError>),
    Heartbeat,
}

enum ConnectPhase {
    Disconnect(oneshot::Sender<()>),
    Retry(ConnectionError),
    Fatal(ConnectionError),
}

/// Wait for a disconnect command, buffering sends for replay.
async fn wait_disconnect(
    rx: &mut mpsc::UnboundedReceiver<Command>,
    replay: &mut VecDeque<(SendPriority, ClientMessage)>,
) -> oneshot::Sender<()> {
    loop {
        match rx.recv().await {
            Some(Command::Disconnect { done }) => return done,
            Some(Command::Send { message, priority }) => {
                if priority != SendPriority::Low {
                    replay.push_back((priority, message));
                }
            }
            None => {
                // Handle dropped entirely; fabricate a sender nobody awaits.
                let (done, _) = oneshot::channel();
                return done;
            }
        }
    }
}
