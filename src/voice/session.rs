use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::connection::{handshake, VoiceControl};
use super::frame::FrameSize;
use super::player::{self, PlaybackControl};
use super::registry::{VoiceCredentials, VoiceRegistry};
use super::source::{EncoderOptions, FfmpegSource, FrameSource};
use super::state::VoiceConnectionState;
use super::udp::UdpSink;
use crate::config::VoiceConfig;
use crate::error::{ClientError, ClientResult};
use crate::gateway::{Connector, GatewayHandle, Payload};

/// A joined voice channel with its own voice gateway socket and UDP path.
///
/// ```no_run
/// # async fn demo(ctx: fluxer::client::Context) -> fluxer::error::ClientResult<()> {
/// use fluxer::voice::FrameSize;
///
/// let voice = ctx.join_voice("guild_id", "channel_id").await?;
/// voice.set_frame_size(FrameSize::Ms40);
/// voice.play_file("song.mp3").await?;
/// voice.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct VoiceSession {
    guild_id: String,
    channel_id: String,
    ssrc: u32,
    gateway: GatewayHandle,
    config: VoiceConfig,
    frame_size: Mutex<FrameSize>,
    state: Arc<watch::Sender<VoiceConnectionState>>,
    sink: tokio::sync::Mutex<Option<UdpSink>>,
    playback: Mutex<Option<PlaybackControl>>,
    stop: CancellationToken,
    left: AtomicBool,
}

impl VoiceSession {
    /// Asks the gateway to join `channel_id`, waits for the server/state
    /// update pair, then runs the voice handshake.
    pub async fn join(
        gateway: &GatewayHandle,
        registry: &VoiceRegistry,
        connector: Arc<dyn Connector>,
        config: VoiceConfig,
        guild_id: &str,
        channel_id: &str,
    ) -> ClientResult<Self> {
        let (state, _) = watch::channel(VoiceConnectionState::Idle);
        let state = Arc::new(state);

        let pending = registry.register(guild_id);
        state.send_replace(VoiceConnectionState::AwaitingVoiceServerUpdate);
        if let Err(e) = gateway
            .send(Payload::voice_state_update(guild_id, Some(channel_id), false, false))
            .await
        {
            registry.cancel(guild_id);
            return Err(e);
        }

        let credentials = match timeout(config.join_timeout, pending).await {
            Ok(Ok(credentials)) => credentials,
            Ok(Err(_)) => return Err(ClientError::voice("voice join was superseded")),
            Err(_) => {
                registry.cancel(guild_id);
                return Err(ClientError::voice(format!(
                    "timed out waiting for VOICE_SERVER_UPDATE in guild {guild_id}"
                )));
            }
        };

        match Self::connect(credentials, gateway.clone(), connector, config, state).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!("Voice handshake in guild {guild_id} failed: {e}");
                let leave = Payload::voice_state_update(guild_id, None, false, false);
                let _ = gateway.send(leave).await;
                Err(e)
            }
        }
    }

    async fn connect(
        credentials: VoiceCredentials,
        gateway: GatewayHandle,
        connector: Arc<dyn Connector>,
        config: VoiceConfig,
        state: Arc<watch::Sender<VoiceConnectionState>>,
    ) -> ClientResult<Self> {
        let established = timeout(
            config.handshake_timeout,
            handshake(connector.as_ref(), &credentials, &config, &state),
        )
        .await
        .map_err(|_| ClientError::voice("voice handshake timed out"))??;
        debug!(
            "Voice UDP path open, external address {}:{}",
            established.external.ip, established.external.port
        );

        let stop = CancellationToken::new();
        let (control, handle) = VoiceControl::new(
            established.gateway,
            connector,
            credentials.clone(),
            &config,
            established.ssrc,
            state.clone(),
            stop.clone(),
        )?;
        tokio::spawn(control.run());

        let sink = UdpSink::new(established.socket, established.ssrc, established.cipher, handle);
        state.send_replace(VoiceConnectionState::Ready);

        Ok(Self {
            guild_id: credentials.guild_id,
            channel_id: credentials.channel_id,
            ssrc: established.ssrc,
            gateway,
            frame_size: Mutex::new(config.frame_size),
            config,
            state,
            sink: tokio::sync::Mutex::new(Some(sink)),
            playback: Mutex::new(None),
            stop,
            left: AtomicBool::new(false),
        })
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn state(&self) -> VoiceConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<VoiceConnectionState> {
        self.state.subscribe()
    }

    /// Takes effect from the next playback on.
    pub fn set_frame_size(&self, frame_size: FrameSize) {
        *self.frame_size.lock().unwrap_or_else(PoisonError::into_inner) = frame_size;
    }

    pub fn frame_size(&self) -> FrameSize {
        *self.frame_size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves when the file has played out or playback was stopped.
    /// A new playback replaces a running one.
    pub async fn play_file(&self, path: impl AsRef<Path>) -> ClientResult<()> {
        self.ensure_live()?;
        let source = FfmpegSource::file(&self.encoder_options(), path.as_ref())?;
        self.play_source(source).await
    }

    /// Like [`play_file`](Self::play_file), but feeds the encoder from any
    /// reader.
    pub async fn play_stream<R>(&self, input: R) -> ClientResult<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.ensure_live()?;
        let source = FfmpegSource::stream(&self.encoder_options(), input)?;
        self.play_source(source).await
    }

    /// Plays already-encoded Opus frames.
    pub async fn play_source<S: FrameSource>(&self, mut source: S) -> ClientResult<()> {
        let (control, signals) = PlaybackControl::pair();
        if let Some(previous) = self.playback().replace(control) {
            previous.stop();
        }

        let frame = self.frame_size();
        let mut sink = self.sink.lock().await;
        let result = match sink.as_mut() {
            Some(sink) if !self.stop.is_cancelled() => {
                player::play(&mut source, sink, frame, signals).await
            }
            _ => {
                source.abort().await;
                Err(ClientError::voice("voice session is stopped"))
            }
        };
        drop(sink);

        if let Err(e) = &result {
            warn!("Playback in guild {} failed: {e}", self.guild_id);
        }
        result
    }

    /// Halts emission; the encoder keeps running and buffering.
    pub fn pause(&self) {
        if let Some(playback) = self.playback().as_ref() {
            playback.pause();
        }
    }

    /// Picks up at the exact next frame.
    pub fn unpause(&self) {
        if let Some(playback) = self.playback().as_ref() {
            playback.unpause();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.playback()
            .as_ref()
            .is_some_and(|playback| playback.is_paused() && !playback.is_stopped())
    }

    /// Ends playback, closes the voice socket and UDP path, and leaves the
    /// channel. Calling it again does nothing.
    pub async fn stop(&self) -> ClientResult<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(playback) = self.playback().take() {
            playback.stop();
        }
        self.stop.cancel();
        self.sink.lock().await.take();
        self.state.send_replace(VoiceConnectionState::Disconnected);

        info!("Leaving voice channel {} in guild {}", self.channel_id, self.guild_id);
        let leave = Payload::voice_state_update(&self.guild_id, None, false, false);
        if let Err(e) = self.gateway.send(leave).await {
            warn!("Could not tell the gateway we left voice: {e}");
        }
        Ok(())
    }

    fn ensure_live(&self) -> ClientResult<()> {
        if self.stop.is_cancelled() {
            Err(ClientError::voice("voice session is stopped"))
        } else {
            Ok(())
        }
    }

    fn encoder_options(&self) -> EncoderOptions {
        EncoderOptions {
            ffmpeg: self.config.ffmpeg.clone(),
            bitrate_kbps: self.config.bitrate_kbps,
            frame_size: self.frame_size(),
        }
    }

    fn playback(&self) -> std::sync::MutexGuard<'_, Option<PlaybackControl>> {
        self.playback.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
