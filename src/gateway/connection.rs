use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::close_code::{self, CloseAction};
use super::heartbeat::Heartbeat;
use super::listener::Listeners;
use super::opcode::GatewayOpcode;
use super::payload::{Hello, Identify, Payload};
use super::session::Session;
use super::state::ConnectionState;
use super::transport::{Connector, Frame, Transport};
use crate::config::GatewayConfig;
use crate::error::{ClientError, ClientResult};
use crate::model::Ready;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY_BASE: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(60);
const RECONNECT_JITTER_MAX_MS: u64 = 1_000;
const COMMAND_QUEUE: usize = 32;

/// Anything but 1000/1001 keeps the session resumable on the server side.
const RESUMABLE_CLOSE: u16 = 4000;

/// Lifecycle notifications, separate from dispatches (those go through
/// [`Listeners`]).
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    StateChanged(ConnectionState),
    Ready { session_id: String },
    Resumed,
    HeartbeatAck { latency: Option<Duration> },
    Closed { code: u16, reason: String },
}

enum Command {
    Send {
        payload: Payload,
        reply: oneshot::Sender<ClientResult<()>>,
    },
}

/// Cheap, cloneable way to talk to a running [`GatewayConnection`].
#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
}

impl GatewayHandle {
    /// Queues `payload` and resolves once it was written to the socket.
    /// Waits while the connection is (re)connecting. Rejected with
    /// [`ClientError::ShuttingDown`] if the connection goes away first.
    pub async fn send(&self, payload: Payload) -> ClientResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, reply })
            .await
            .map_err(|_| ClientError::ShuttingDown)?;
        rx.await.map_err(|_| ClientError::ShuttingDown)?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves on READY/RESUMED; errors if the connection closes for good.
    pub async fn wait_until_connected(&self) -> ClientResult<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| s.is_connected() || s.is_closed())
            .await
            .map_err(|_| ClientError::ShuttingDown)?;
        if reached.is_connected() {
            Ok(())
        } else {
            Err(ClientError::ShuttingDown)
        }
    }

    /// Closes the socket with 1000, stops heartbeating and rejects every
    /// pending [`send`](Self::send). Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

enum Disconnect {
    Shutdown,
    /// Server close, transport failure or a failed handshake.
    Closed { code: u16, reason: String },
    /// We dropped the socket ourselves and want to resume.
    Restart { reason: String },
}

enum Flow {
    Continue,
    HeartbeatNow,
    Reconnect,
    InvalidSession { resumable: bool },
}

enum Step {
    Shutdown,
    Frame(Option<ClientResult<Frame>>),
    Zombied,
    Beat,
    Command(Command),
}

/// One persistent gateway socket plus the session riding on it.
///
/// Runs as its own task and is the only writer of its [`Session`]. Dispatches
/// are handed to [`Listeners`] strictly in arrival order.
pub struct GatewayConnection {
    token: String,
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    listeners: Listeners,
    session: Session,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<GatewayEvent>>,
    commands: mpsc::Receiver<Command>,
    commands_tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    failed_attempts: u32,
}

impl GatewayConnection {
    pub fn new(
        token: impl Into<String>,
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        listeners: Listeners,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        Self {
            token: token.into(),
            config,
            connector,
            listeners,
            session: Session::new(),
            state,
            events,
            events_rx: Some(events_rx),
            commands,
            commands_tx,
            shutdown: CancellationToken::new(),
            failed_attempts: 0,
        }
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            commands: self.commands_tx.clone(),
            state: self.state.subscribe(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Lifecycle event stream. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<GatewayEvent>> {
        self.events_rx.take()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Replaces the configured gateway URL, e.g. with the one `/gateway/bot`
    /// returned. A known resume URL still wins.
    pub fn set_gateway_url(&mut self, url: impl Into<String>) {
        self.config.url = url.into();
    }

    pub fn spawn(self) -> JoinHandle<ClientResult<()>> {
        tokio::spawn(self.run())
    }

    /// Drives the connection until shutdown (`Ok`) or a close that must not
    /// be retried (`Err`).
    pub async fn run(mut self) -> ClientResult<()> {
        loop {
            let (action, code, reason) = match self.run_socket().await {
                Disconnect::Shutdown => {
                    self.set_state(ConnectionState::Closed);
                    info!("Gateway shut down");
                    return Ok(());
                }
                Disconnect::Closed { code, reason } => {
                    let _ = self.events.send(GatewayEvent::Closed {
                        code,
                        reason: reason.clone(),
                    });
                    (self.on_close(code, &reason), code, reason)
                }
                Disconnect::Restart { reason } => {
                    info!("Dropping gateway socket: {}", reason);
                    (CloseAction::Resume, RESUMABLE_CLOSE, reason)
                }
            };

            if action == CloseAction::Terminal {
                self.reject_pending();
                self.set_state(ConnectionState::Closed);
                return Err(ClientError::SessionTerminal { code, reason });
            }

            if !self.config.auto_reconnect {
                self.reject_pending();
                self.set_state(ConnectionState::Closed);
                return Err(ClientError::ConnectionClosed { code, reason });
            }

            self.failed_attempts += 1;
            if self.failed_attempts > self.config.max_reconnect_attempts {
                error!(
                    "Giving up on the gateway after {} reconnect attempts",
                    self.config.max_reconnect_attempts
                );
                self.reject_pending();
                self.set_state(ConnectionState::Closed);
                return Err(ClientError::ConnectionClosed { code, reason });
            }

            self.set_state(ConnectionState::Reconnecting {
                attempt: self.failed_attempts,
            });
            let delay = backoff_delay(self.failed_attempts);
            info!(
                "Reconnecting to the gateway in {}ms (attempt {}, {})",
                delay.as_millis(),
                self.failed_attempts,
                if self.session.can_resume() { "resume" } else { "identify" }
            );

            let cancelled = tokio::select! {
                _ = sleep(delay) => false,
                _ = self.shutdown.cancelled() => true,
            };
            if cancelled {
                self.reject_pending();
                self.set_state(ConnectionState::Closed);
                return Ok(());
            }
        }
    }

    /// Classifies a close and updates the session accordingly.
    fn on_close(&mut self, code: u16, reason: &str) -> CloseAction {
        let action = close_code::classify(code);
        match action {
            CloseAction::Terminal => {
                error!("Gateway closed with terminal code {}: {}", code, reason);
                self.session.invalidate();
            }
            CloseAction::Reidentify => {
                warn!("Gateway closed with code {}: {}; session discarded", code, reason);
                self.session.invalidate();
            }
            CloseAction::Resume => {
                warn!("Gateway closed with code {}: {}", code, reason);
            }
        }
        action
    }

    async fn run_socket(&mut self) -> Disconnect {
        self.set_state(ConnectionState::Connecting);
        let mut transport = match self.connect().await {
            Ok(Some(transport)) => transport,
            Ok(None) => return Disconnect::Shutdown,
            Err(e) => {
                return Disconnect::Closed {
                    code: 1006,
                    reason: e.to_string(),
                }
            }
        };

        self.set_state(ConnectionState::AwaitingHello);
        let hello = tokio::select! {
            result = timeout(HELLO_TIMEOUT, self.await_hello(transport.as_mut())) => Some(result),
            _ = self.shutdown.cancelled() => None,
        };
        let Some(hello) = hello else {
            let _ = transport.close(1000).await;
            self.reject_pending();
            return Disconnect::Shutdown;
        };
        let interval = match hello {
            Ok(Ok(interval)) => interval,
            Ok(Err(disconnect)) => return disconnect,
            Err(_) => {
                let _ = transport.close(RESUMABLE_CLOSE).await;
                return Disconnect::Closed {
                    code: 1006,
                    reason: "timed out waiting for HELLO".into(),
                };
            }
        };

        let now = Instant::now();
        self.session.set_heartbeat_interval(interval);
        self.session.record_ack(now);
        let mut heartbeat = Heartbeat::new(interval, now);
        let mut ticker = interval_at(now + heartbeat.first_delay(), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handshake = if self.session.can_resume() {
            self.resume(transport.as_mut()).await
        } else {
            self.identify(transport.as_mut()).await
        };
        if let Err(e) = handshake {
            return Disconnect::Closed {
                code: 1006,
                reason: e.to_string(),
            };
        }

        loop {
            let connected = self.state.borrow().is_connected();
            // Beats go out even while a backlog of frames is being drained.
            // Queued frames still win over the liveness check, since the ACKs
            // may be sitting among them.
            let step = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Step::Shutdown,
                _ = ticker.tick() => Step::Beat,
                frame = transport.recv() => Step::Frame(frame),
                _ = sleep_until(heartbeat.deadline()) => Step::Zombied,
                Some(command) = self.commands.recv(), if connected => Step::Command(command),
            };

            match step {
                Step::Shutdown => {
                    let _ = transport.close(1000).await;
                    self.reject_pending();
                    return Disconnect::Shutdown;
                }
                Step::Zombied => {
                    warn!(
                        "No heartbeat ACK for {}ms, presuming the connection dead",
                        (heartbeat.interval() * 2).as_millis()
                    );
                    let _ = transport.close(RESUMABLE_CLOSE).await;
                    return Disconnect::Restart {
                        reason: "heartbeat ACK timeout".into(),
                    };
                }
                Step::Beat => {
                    if let Err(e) = self.send_heartbeat(transport.as_mut(), &mut heartbeat).await {
                        return Disconnect::Closed {
                            code: 1006,
                            reason: e.to_string(),
                        };
                    }
                }
                Step::Command(Command::Send { payload, reply }) => {
                    match self.send_payload(transport.as_mut(), &payload).await {
                        Ok(()) => {
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            let _ = reply.send(Err(e));
                            return Disconnect::Closed { code: 1006, reason };
                        }
                    }
                }
                Step::Frame(None) => {
                    return Disconnect::Closed {
                        code: 1006,
                        reason: "stream ended without a close frame".into(),
                    };
                }
                Step::Frame(Some(Err(e))) => {
                    return Disconnect::Closed {
                        code: 1006,
                        reason: e.to_string(),
                    };
                }
                Step::Frame(Some(Ok(Frame::Close { code, reason }))) => {
                    return Disconnect::Closed { code, reason };
                }
                Step::Frame(Some(Ok(Frame::Text(text)))) => {
                    let result = match self.handle_text(&text, &mut heartbeat) {
                        Flow::Continue => Ok(()),
                        Flow::HeartbeatNow => {
                            self.send_heartbeat(transport.as_mut(), &mut heartbeat).await
                        }
                        Flow::Reconnect => {
                            let _ = transport.close(RESUMABLE_CLOSE).await;
                            return Disconnect::Restart {
                                reason: "server requested a reconnect".into(),
                            };
                        }
                        Flow::InvalidSession { resumable } => {
                            match self.recover_session(transport.as_mut(), resumable).await {
                                Ok(true) => Ok(()),
                                Ok(false) => {
                                    let _ = transport.close(1000).await;
                                    self.reject_pending();
                                    return Disconnect::Shutdown;
                                }
                                Err(e) => Err(e),
                            }
                        }
                    };
                    if let Err(e) = result {
                        return Disconnect::Closed {
                            code: 1006,
                            reason: e.to_string(),
                        };
                    }
                }
            }
        }
    }

    async fn connect(&mut self) -> ClientResult<Option<Box<dyn Transport>>> {
        let base = self
            .session
            .resume_url()
            .unwrap_or(self.config.url.as_str())
            .to_string();
        let url = gateway_url(&base, self.config.version)?;
        debug!("Connecting to gateway at {}", url);

        tokio::select! {
            result = self.connector.connect(&url) => result.map(Some),
            _ = self.shutdown.cancelled() => Ok(None),
        }
    }

    async fn await_hello(&self, transport: &mut dyn Transport) -> Result<Duration, Disconnect> {
        loop {
            let text = match transport.recv().await {
                Some(Ok(Frame::Text(text))) => text,
                Some(Ok(Frame::Close { code, reason })) => {
                    return Err(Disconnect::Closed { code, reason })
                }
                Some(Err(e)) => {
                    return Err(Disconnect::Closed {
                        code: 1006,
                        reason: e.to_string(),
                    })
                }
                None => {
                    return Err(Disconnect::Closed {
                        code: 1006,
                        reason: "stream ended before HELLO".into(),
                    })
                }
            };

            let payload = match Payload::decode(&text) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Dropping malformed gateway frame: {}", e);
                    continue;
                }
            };
            self.listeners.emit_raw(&payload);

            if payload.opcode() != Some(GatewayOpcode::Hello) {
                debug!("Ignoring op {} before HELLO", payload.op);
                continue;
            }

            match Hello::deserialize(&payload.d) {
                Ok(hello) if hello.heartbeat_interval > 0 => {
                    debug!("HELLO, heartbeat interval {}ms", hello.heartbeat_interval);
                    return Ok(Duration::from_millis(hello.heartbeat_interval));
                }
                Ok(_) => warn!("HELLO with a zero heartbeat interval"),
                Err(e) => warn!("Malformed HELLO: {}", e),
            }
        }
    }

    async fn identify(&mut self, transport: &mut dyn Transport) -> ClientResult<()> {
        self.set_state(ConnectionState::Identifying);
        let identify = Identify {
            token: self.token.clone(),
            intents: self.config.intents,
            properties: self.config.properties.clone(),
            shard: self.config.shard,
            compress: None,
            large_threshold: self.config.large_threshold,
        };
        match self.config.shard {
            Some([id, count]) => debug!("Identifying as shard {}/{}", id, count),
            None => debug!("Identifying"),
        }
        self.send_payload(transport, &Payload::identify(&identify)?).await
    }

    async fn resume(&mut self, transport: &mut dyn Transport) -> ClientResult<()> {
        let Some(session_id) = self.session.id().map(str::to_owned) else {
            return self.identify(transport).await;
        };
        let seq = self.session.sequence().unwrap_or(0);
        self.set_state(ConnectionState::Resuming);
        debug!("Resuming session {} at sequence {}", session_id, seq);
        self.send_payload(transport, &Payload::resume(&self.token, &session_id, seq))
            .await
    }

    /// Handles INVALID_SESSION on a live socket. `Ok(false)` means shutdown
    /// was requested while waiting.
    async fn recover_session(
        &mut self,
        transport: &mut dyn Transport,
        resumable: bool,
    ) -> ClientResult<bool> {
        if resumable && self.session.can_resume() {
            warn!("Session invalidated but resumable, resuming");
            self.resume(transport).await?;
            return Ok(true);
        }

        warn!("Session invalidated, identifying from scratch");
        self.session.invalidate();
        let wait = Duration::from_millis(rand::rng().random_range(1_000..=5_000));
        tokio::select! {
            _ = sleep(wait) => {}
            _ = self.shutdown.cancelled() => return Ok(false),
        }
        self.identify(transport).await?;
        Ok(true)
    }

    fn handle_text(&mut self, text: &str, heartbeat: &mut Heartbeat) -> Flow {
        let payload = match Payload::decode(text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping malformed gateway frame: {}", e);
                return Flow::Continue;
            }
        };
        trace!("Gateway <- op {} t {:?} s {:?}", payload.op, payload.t, payload.s);

        self.listeners.emit_raw(&payload);
        self.session.observe_sequence(payload.s);

        match payload.opcode() {
            Some(GatewayOpcode::Dispatch) => {
                self.handle_dispatch(&payload);
                Flow::Continue
            }
            Some(GatewayOpcode::Heartbeat) => Flow::HeartbeatNow,
            Some(GatewayOpcode::HeartbeatAck) => {
                let now = Instant::now();
                let latency = heartbeat.record_ack(now);
                self.session.record_ack(now);
                let _ = self.events.send(GatewayEvent::HeartbeatAck { latency });
                Flow::Continue
            }
            Some(GatewayOpcode::Reconnect) => Flow::Reconnect,
            Some(GatewayOpcode::InvalidSession) => Flow::InvalidSession {
                resumable: payload.d.as_bool().unwrap_or(false),
            },
            Some(GatewayOpcode::Hello) => {
                debug!("Ignoring HELLO on an established socket");
                Flow::Continue
            }
            _ => {
                debug!("Unhandled gateway op {}", payload.op);
                Flow::Continue
            }
        }
    }

    fn handle_dispatch(&mut self, payload: &Payload) {
        let Some(event) = payload.t.as_deref() else {
            warn!("Dispatch without an event name");
            return;
        };

        match event {
            "READY" => match Ready::deserialize(&payload.d) {
                Ok(ready) => {
                    let shard = ready.shard.or(self.config.shard);
                    self.session
                        .start(ready.session_id.clone(), ready.resume_gateway_url, shard);
                    self.failed_attempts = 0;
                    info!("Gateway ready, session {}", ready.session_id);
                    self.set_state(ConnectionState::Connected);
                    let _ = self.events.send(GatewayEvent::Ready {
                        session_id: ready.session_id,
                    });
                }
                Err(e) => warn!("READY payload did not decode: {}", e),
            },
            "RESUMED" => {
                self.failed_attempts = 0;
                info!("Session resumed at sequence {:?}", self.session.sequence());
                self.set_state(ConnectionState::Connected);
                let _ = self.events.send(GatewayEvent::Resumed);
            }
            _ => {}
        }

        self.listeners.emit(event, &payload.d);
    }

    async fn send_heartbeat(
        &mut self,
        transport: &mut dyn Transport,
        heartbeat: &mut Heartbeat,
    ) -> ClientResult<()> {
        heartbeat.record_sent(Instant::now());
        let payload = Payload::heartbeat(self.session.sequence());
        self.send_payload(transport, &payload).await
    }

    async fn send_payload(
        &self,
        transport: &mut dyn Transport,
        payload: &Payload,
    ) -> ClientResult<()> {
        trace!("Gateway -> op {}", payload.op);
        transport.send(payload.encode()?).await
    }

    fn reject_pending(&mut self) {
        self.commands.close();
        while let Ok(Command::Send { reply, .. }) = self.commands.try_recv() {
            let _ = reply.send(Err(ClientError::ShuttingDown));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Gateway state {} -> {}", previous, state);
            let _ = self.events.send(GatewayEvent::StateChanged(state));
        }
    }
}

fn gateway_url(base: &str, version: u8) -> ClientResult<String> {
    let mut url = Url::parse(base)
        .map_err(|e| ClientError::transport(format!("invalid gateway url {base}: {e}")))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("v", &version.to_string())
        .append_pair("encoding", "json");
    Ok(url.into())
}

fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    let delay = RECONNECT_DELAY_BASE
        .saturating_mul(2_u32.pow(exponent))
        .min(RECONNECT_DELAY_MAX);
    let jitter = rand::rng().random_range(0..RECONNECT_JITTER_MAX_MS);
    delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_url_sets_version_and_encoding() {
        assert_eq!(
            gateway_url("wss://gateway.fluxer.app", 1).unwrap(),
            "wss://gateway.fluxer.app/?v=1&encoding=json"
        );
        assert_eq!(
            gateway_url("wss://resume.fluxer.app/?v=9", 1).unwrap(),
            "wss://resume.fluxer.app/?v=1&encoding=json"
        );
        assert!(gateway_url("not a url", 1).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1);
        assert!(first >= RECONNECT_DELAY_BASE);
        assert!(first < RECONNECT_DELAY_BASE + Duration::from_millis(RECONNECT_JITTER_MAX_MS));

        let capped = backoff_delay(50);
        assert!(capped >= RECONNECT_DELAY_MAX);
        assert!(capped < RECONNECT_DELAY_MAX + Duration::from_millis(RECONNECT_JITTER_MAX_MS));
    }
}
