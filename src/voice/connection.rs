use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, trace, warn};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::crypto::{select_mode, PacketCipher};
use super::discovery::{discover, ExternalAddress};
use super::opcode::{classify_voice_close, is_dave_opcode, VoiceOpcode};
use super::payload::{HeartbeatAck, SessionDescription, VoiceHello, VoicePayload, VoiceReady};
use super::registry::VoiceCredentials;
use super::state::VoiceConnectionState;
use crate::config::VoiceConfig;
use crate::gateway::{CloseAction, Connector, Frame, Heartbeat, Transport};
use crate::error::{ClientError, ClientResult};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const RESUME_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_QUEUE: usize = 16;
/// Close code used when we drop a socket whose heartbeats went unanswered.
const ZOMBIE_CLOSE: u16 = 4000;

/// `wss://{endpoint}/?v={version}`. Endpoints usually come without a scheme.
pub(crate) fn voice_gateway_url(endpoint: &str, version: u8) -> ClientResult<String> {
    let base = if endpoint.starts_with("wss://") || endpoint.starts_with("ws://") {
        endpoint.to_string()
    } else {
        format!("wss://{endpoint}")
    };
    let mut url = Url::parse(&base)
        .map_err(|e| ClientError::voice(format!("invalid voice endpoint {endpoint}: {e}")))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("v", &version.to_string());
    Ok(url.into())
}

/// One voice gateway socket. Keeps heartbeating while any of its `async`
/// methods is waiting.
pub(crate) struct VoiceGateway {
    transport: Box<dyn Transport>,
    heartbeat: Heartbeat,
    ticker: Interval,
    seq_ack: Option<u64>,
    last_nonce: Option<u64>,
}

pub(crate) enum Wake {
    Frame(Option<ClientResult<Frame>>),
    Zombied,
    Beat,
}

impl VoiceGateway {
    pub(crate) async fn open(connector: &dyn Connector, url: &str) -> ClientResult<Self> {
        debug!("Connecting to voice gateway at {url}");
        let mut transport = connector.connect(url).await?;
        let interval = timeout(HELLO_TIMEOUT, await_hello(transport.as_mut()))
            .await
            .map_err(|_| ClientError::voice("timed out waiting for voice HELLO"))??;

        let now = Instant::now();
        let mut ticker = interval_at(now + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(Self {
            transport,
            heartbeat: Heartbeat::new(interval, now),
            ticker,
            seq_ack: None,
            last_nonce: None,
        })
    }

    pub(crate) fn seq_ack(&self) -> Option<u64> {
        self.seq_ack
    }

    pub(crate) fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    pub(crate) async fn send(&mut self, payload: &VoicePayload) -> ClientResult<()> {
        trace!("Voice -> op {}", payload.op);
        self.transport.send(payload.encode()?).await
    }

    /// Next payload worth acting on. Heartbeat ACKs and DAVE traffic are
    /// consumed here. A close surfaces as [`ClientError::ConnectionClosed`].
    pub(crate) async fn next(&mut self) -> ClientResult<VoicePayload> {
        loop {
            let wake = self.wake().await;
            if let Some(payload) = self.handle(wake).await? {
                return Ok(payload);
            }
        }
    }

    /// Waits for the next frame or timer. Cancel-safe, so it can sit in a
    /// `select!` next to other work; pass the result to [`handle`](Self::handle).
    pub(crate) async fn wake(&mut self) -> Wake {
        let deadline = self.heartbeat.deadline();
        tokio::select! {
            biased;
            _ = self.ticker.tick() => Wake::Beat,
            frame = self.transport.recv() => Wake::Frame(frame),
            _ = sleep_until(deadline) => Wake::Zombied,
        }
    }

    /// Acts on a [`Wake`]. Not cancel-safe: a beat marked as sent here is
    /// also written here.
    pub(crate) async fn handle(&mut self, wake: Wake) -> ClientResult<Option<VoicePayload>> {
        match wake {
            Wake::Frame(frame) => self.on_frame(frame),
            Wake::Zombied => {
                warn!("Voice heartbeat went unanswered");
                let _ = self.transport.close(ZOMBIE_CLOSE).await;
                Err(ClientError::ConnectionClosed {
                    code: ZOMBIE_CLOSE,
                    reason: "voice heartbeat ACK timeout".into(),
                })
            }
            Wake::Beat => self.beat().await.map(|()| None),
        }
    }

    /// Waits for a specific op, skipping anything else.
    pub(crate) async fn await_op(&mut self, op: VoiceOpcode) -> ClientResult<VoicePayload> {
        loop {
            let payload = self.next().await?;
            if payload.opcode() == Some(op) {
                return Ok(payload);
            }
            debug!("Ignoring voice op {} while waiting for {:?}", payload.op, op);
        }
    }

    /// Runs `work` to completion without letting heartbeats lapse.
    pub(crate) async fn drive<F: Future>(&mut self, work: F) -> ClientResult<F::Output> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = self.ticker.tick() => {}
            }
            self.beat().await?;
        }
    }

    pub(crate) async fn close(&mut self, code: u16) {
        if let Err(e) = self.transport.close(code).await {
            debug!("Voice gateway close failed: {e}");
        }
    }

    fn on_frame(&mut self, frame: Option<ClientResult<Frame>>) -> ClientResult<Option<VoicePayload>> {
        let text = match frame {
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Close { code, reason })) => {
                return Err(ClientError::ConnectionClosed { code, reason })
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ClientError::ConnectionClosed {
                    code: 1006,
                    reason: "voice stream ended".into(),
                })
            }
        };

        let payload = match VoicePayload::decode(&text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping malformed voice frame: {e}");
                return Ok(None);
            }
        };
        trace!("Voice <- op {} seq {:?}", payload.op, payload.seq);
        if let Some(seq) = payload.seq {
            self.seq_ack = Some(self.seq_ack.map_or(seq, |known| known.max(seq)));
        }

        if payload.opcode() == Some(VoiceOpcode::HeartbeatAck) {
            let nonce = HeartbeatAck::deserialize(&payload.d).ok().and_then(|ack| ack.t);
            if nonce.is_some() && nonce != self.last_nonce {
                debug!("Voice heartbeat ACK for nonce {nonce:?}, expected {:?}", self.last_nonce);
            }
            self.heartbeat.record_ack(Instant::now());
            return Ok(None);
        }
        if is_dave_opcode(payload.op) {
            trace!("Ignoring DAVE op {}", payload.op);
            return Ok(None);
        }
        Ok(Some(payload))
    }

    async fn beat(&mut self) -> ClientResult<()> {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.last_nonce = Some(nonce);
        self.heartbeat.record_sent(Instant::now());
        self.send(&VoicePayload::heartbeat(nonce, self.seq_ack)).await
    }
}

async fn await_hello(transport: &mut dyn Transport) -> ClientResult<Duration> {
    loop {
        let text = match transport.recv().await {
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Close { code, reason })) => {
                return Err(ClientError::ConnectionClosed { code, reason })
            }
            Some(Err(e)) => return Err(e),
            None => return Err(ClientError::transport("voice stream ended before HELLO")),
        };
        let payload = match VoicePayload::decode(&text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping malformed voice frame: {e}");
                continue;
            }
        };
        if payload.opcode() != Some(VoiceOpcode::Hello) {
            debug!("Ignoring voice op {} before HELLO", payload.op);
            continue;
        }
        let hello = VoiceHello::deserialize(&payload.d)?;
        return Duration::try_from_secs_f64(hello.heartbeat_interval / 1_000.0)
            .ok()
            .filter(|interval| !interval.is_zero())
            .ok_or_else(|| ClientError::protocol("voice HELLO with an unusable interval"));
    }
}

/// What a finished handshake hands to the session.
pub(crate) struct Established {
    pub(crate) gateway: VoiceGateway,
    pub(crate) socket: UdpSocket,
    pub(crate) ssrc: u32,
    pub(crate) cipher: PacketCipher,
    pub(crate) external: ExternalAddress,
}

/// IDENTIFY, READY, UDP connect, IP discovery, SELECT_PROTOCOL, SESSION_DESCRIPTION.
pub(crate) async fn handshake(
    connector: &dyn Connector,
    credentials: &VoiceCredentials,
    config: &VoiceConfig,
    state: &watch::Sender<VoiceConnectionState>,
) -> ClientResult<Established> {
    let url = voice_gateway_url(&credentials.endpoint, config.gateway_version)?;
    let mut gateway = VoiceGateway::open(connector, &url).await?;

    gateway
        .send(&VoicePayload::identify(
            &credentials.guild_id,
            &credentials.user_id,
            &credentials.session_id,
            &credentials.token,
        ))
        .await?;
    let ready = VoiceReady::deserialize(&gateway.await_op(VoiceOpcode::Ready).await?.d)?;
    debug!("Voice READY, ssrc {} at {}:{}", ready.ssrc, ready.ip, ready.port);
    let mode = select_mode(&ready.modes)?;

    state.send_replace(VoiceConnectionState::ConnectingUdp);
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((ready.ip.as_str(), ready.port)).await?;

    state.send_replace(VoiceConnectionState::Discovering);
    let external = gateway
        .drive(discover(
            &socket,
            ready.ssrc,
            config.discovery_attempts,
            config.discovery_timeout,
        ))
        .await??;

    gateway
        .send(&VoicePayload::select_protocol(&external.ip, external.port, mode))
        .await?;
    let description =
        SessionDescription::deserialize(&gateway.await_op(VoiceOpcode::SessionDescription).await?.d)?;
    let cipher = PacketCipher::new(&description.mode, &description.secret_key)?;
    info!("Voice session ready in guild {} (mode {})", credentials.guild_id, description.mode);

    Ok(Established {
        gateway,
        socket,
        ssrc: ready.ssrc,
        cipher,
        external,
    })
}

pub(crate) enum ControlCommand {
    Speaking {
        speaking: bool,
        reply: oneshot::Sender<ClientResult<()>>,
    },
}

/// Talks to the control task. Dropping every handle ends the task.
#[derive(Clone)]
pub(crate) struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    pub(crate) async fn set_speaking(&self, speaking: bool) -> ClientResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ControlCommand::Speaking { speaking, reply })
            .await
            .map_err(|_| ClientError::voice("voice connection is closed"))?;
        rx.await
            .map_err(|_| ClientError::voice("voice connection is closed"))?
    }
}

enum ControlStep {
    Stop,
    Command(Option<ControlCommand>),
    Gateway(Wake),
}

/// Owns the voice gateway socket after the handshake: heartbeats, SPEAKING,
/// and one RESUME attempt when the socket drops with a recoverable code.
pub(crate) struct VoiceControl {
    gateway: VoiceGateway,
    connector: Arc<dyn Connector>,
    url: String,
    credentials: VoiceCredentials,
    ssrc: u32,
    commands: mpsc::Receiver<ControlCommand>,
    state: Arc<watch::Sender<VoiceConnectionState>>,
    stop: CancellationToken,
}

impl VoiceControl {
    pub(crate) fn new(
        gateway: VoiceGateway,
        connector: Arc<dyn Connector>,
        credentials: VoiceCredentials,
        config: &VoiceConfig,
        ssrc: u32,
        state: Arc<watch::Sender<VoiceConnectionState>>,
        stop: CancellationToken,
    ) -> ClientResult<(Self, ControlHandle)> {
        let url = voice_gateway_url(&credentials.endpoint, config.gateway_version)?;
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        Ok((
            Self {
                gateway,
                connector,
                url,
                credentials,
                ssrc,
                commands,
                state,
                stop,
            },
            ControlHandle {
                commands: commands_tx,
            },
        ))
    }

    pub(crate) async fn run(mut self) {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.stop.cancelled() => ControlStep::Stop,
                command = self.commands.recv() => ControlStep::Command(command),
                wake = self.gateway.wake() => ControlStep::Gateway(wake),
            };

            match step {
                ControlStep::Stop | ControlStep::Command(None) => {
                    self.gateway.close(1000).await;
                    break;
                }
                ControlStep::Command(Some(ControlCommand::Speaking { speaking, reply })) => {
                    let result = self
                        .gateway
                        .send(&VoicePayload::speaking(self.ssrc, speaking))
                        .await;
                    if result.is_ok() {
                        self.state.send_replace(if speaking {
                            VoiceConnectionState::Speaking
                        } else {
                            VoiceConnectionState::Silent
                        });
                    }
                    let _ = reply.send(result);
                }
                ControlStep::Gateway(wake) => match self.gateway.handle(wake).await {
                    Ok(Some(payload)) => self.on_payload(&payload),
                    Ok(None) => {}
                    Err(err) => {
                        if !self.recover(err).await {
                            self.stop.cancel();
                            break;
                        }
                    }
                },
            }
        }

        self.commands.close();
        while let Ok(ControlCommand::Speaking { reply, .. }) = self.commands.try_recv() {
            let _ = reply.send(Err(ClientError::voice("voice connection is closed")));
        }
        self.state.send_replace(VoiceConnectionState::Disconnected);
        debug!("Voice control for guild {} finished", self.credentials.guild_id);
    }

    fn on_payload(&self, payload: &VoicePayload) {
        match payload.opcode() {
            Some(VoiceOpcode::Speaking) => trace!("Someone's speaking state changed"),
            Some(VoiceOpcode::ClientsConnect) => debug!("Clients joined the voice channel"),
            Some(VoiceOpcode::ClientDisconnect) => debug!("A client left the voice channel"),
            Some(VoiceOpcode::Resumed) => debug!("Voice session resumed"),
            _ => debug!("Unhandled voice op {}", payload.op),
        }
    }

    /// `false` when the session can't continue.
    async fn recover(&mut self, err: ClientError) -> bool {
        let (code, reason) = match err {
            ClientError::ConnectionClosed { code, reason } => (code, reason),
            other => (1006, other.to_string()),
        };
        if classify_voice_close(code) == CloseAction::Terminal {
            error!("Voice gateway closed with terminal code {code}: {reason}");
            return false;
        }

        warn!(
            "Voice gateway closed with code {code}: {reason}; resuming (last latency {:?})",
            self.gateway.latency()
        );
        let attempt = resume_gateway(
            self.connector.as_ref(),
            &self.url,
            &self.credentials,
            self.gateway.seq_ack(),
        );
        let result = tokio::select! {
            result = timeout(RESUME_TIMEOUT, attempt) => result
                .unwrap_or_else(|_| Err(ClientError::voice("timed out resuming the voice session"))),
            _ = self.stop.cancelled() => Err(ClientError::ShuttingDown),
        };

        match result {
            Ok(gateway) => {
                info!("Voice session resumed in guild {}", self.credentials.guild_id);
                self.gateway = gateway;
                true
            }
            Err(e) => {
                error!("Could not resume the voice session: {e}");
                false
            }
        }
    }
}

async fn resume_gateway(
    connector: &dyn Connector,
    url: &str,
    credentials: &VoiceCredentials,
    seq_ack: Option<u64>,
) -> ClientResult<VoiceGateway> {
    let mut gateway = VoiceGateway::open(connector, url).await?;
    gateway.seq_ack = seq_ack;
    gateway
        .send(&VoicePayload::resume(
            &credentials.guild_id,
            &credentials.session_id,
            &credentials.token,
            seq_ack,
        ))
        .await?;
    gateway.await_op(VoiceOpcode::Resumed).await?;
    Ok(gateway)
}
