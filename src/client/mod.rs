use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::Cache;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::event::EventHandler;
use crate::gateway::{
    Connector, GatewayConnection, GatewayHandle, GatewayOpcode, Intents, Listeners, Payload,
    WebSocketConnector,
};
use crate::http::Http;
use crate::model::{Guild, Message, Ready, VoiceServerUpdate, VoiceStateUpdate};
use crate::rest::HttpBackend;
use crate::voice::{FrameSize, VoiceRegistry, VoiceSession};

/// Handed to every [`EventHandler`] call. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    pub http: Arc<Http>,
    pub gateway: GatewayHandle,
    voice: Arc<VoiceRegistry>,
    connector: Arc<dyn Connector>,
    config: Arc<ClientConfig>,
}

impl Context {
    /// Joins a voice channel and resolves once audio can be played.
    pub async fn join_voice(&self, guild_id: &str, channel_id: &str) -> ClientResult<VoiceSession> {
        VoiceSession::join(
            &self.gateway,
            &self.voice,
            self.connector.clone(),
            self.config.voice.clone(),
            guild_id,
            channel_id,
        )
        .await
    }

    pub async fn set_presence(&self, status: &str, activity: Option<&str>) -> ClientResult<()> {
        self.gateway
            .send(Payload::presence_update(status, activity, false))
            .await
    }

    /// Members arrive as `GUILD_MEMBERS_CHUNK` dispatches.
    pub async fn request_guild_members(&self, guild_id: &str, query: &str, limit: u32) -> ClientResult<()> {
        self.gateway
            .send(Payload::request_guild_members(guild_id, query, limit))
            .await
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    resolve_gateway: bool,
    handler: Option<Arc<dyn EventHandler>>,
    listeners: Listeners,
    cache: Option<Arc<dyn Cache>>,
    connector: Option<Arc<dyn Connector>>,
    backend: Option<Arc<dyn HttpBackend>>,
}

impl ClientBuilder {
    pub fn new(token: impl Into<String>) -> Self {
        Self::from_config(ClientConfig::new(token))
    }

    /// Starts from an existing config, e.g. [`ClientConfig::from_env`].
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            resolve_gateway: true,
            handler: None,
            listeners: Listeners::new(),
            cache: None,
            connector: None,
            backend: None,
        }
    }

    pub fn event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Raw and per-event listeners, run synchronously on the gateway task.
    pub fn listeners(mut self, register: impl FnOnce(&mut Listeners)) -> Self {
        register(&mut self.listeners);
        self
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.rest.api_url = url.into();
        self
    }

    /// Skips the `/gateway/bot` lookup and connects here directly.
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway.url = url.into();
        self.resolve_gateway = false;
        self
    }

    pub fn gateway_version(mut self, version: u8) -> Self {
        self.config.gateway.version = version;
        self
    }

    pub fn intents(mut self, intents: Intents) -> Self {
        self.config.gateway.intents = intents;
        self
    }

    pub fn shard(mut self, id: u32, count: u32) -> Self {
        self.config.gateway.shard = Some([id, count]);
        self
    }

    pub fn large_threshold(mut self, threshold: u16) -> Self {
        self.config.gateway.large_threshold = Some(threshold);
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.gateway.auto_reconnect = enabled;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.gateway.max_reconnect_attempts = attempts;
        self
    }

    /// How often a 502/525 is retried, and how long to wait in between.
    pub fn transient_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.config.rest.transient_retries = retries;
        self.config.rest.transient_retry_delay = delay;
        self
    }

    pub fn frame_size(mut self, frame_size: FrameSize) -> Self {
        self.config.voice.frame_size = frame_size;
        self
    }

    pub fn ffmpeg(mut self, path: impl Into<String>) -> Self {
        self.config.voice.ffmpeg = path.into();
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replaces the WebSocket connector used for the gateway and voice.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replaces the HTTP transport under the REST scheduler.
    pub fn http_backend(mut self, backend: Arc<dyn HttpBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> ClientResult<Client> {
        let Self {
            config,
            resolve_gateway,
            handler,
            mut listeners,
            cache,
            connector,
            backend,
        } = self;

        // Both reqwest and tungstenite pull in rustls; pin one provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http = match backend {
            Some(backend) => Http::with_backend(&config.token, backend, &config.rest),
            None => Http::new(&config.token, &config.rest)?,
        };
        if let Some(cache) = cache {
            http = http.with_cache(cache);
        }
        let http = Arc::new(http);
        let connector = connector.unwrap_or_else(|| Arc::new(WebSocketConnector));
        let voice = Arc::new(VoiceRegistry::new());

        register_voice_listeners(&mut listeners, &voice);
        let (dispatches, dispatch_rx) = mpsc::unbounded_channel();
        if handler.is_some() {
            listeners.on_raw(move |payload| {
                if payload.opcode() == Some(GatewayOpcode::Dispatch) {
                    if let Some(event) = &payload.t {
                        let _ = dispatches.send((event.clone(), payload.d.clone()));
                    }
                }
            });
        }

        let connection =
            GatewayConnection::new(&config.token, config.gateway.clone(), connector.clone(), listeners);
        let context = Context {
            http: http.clone(),
            gateway: connection.handle(),
            voice,
            connector,
            config: Arc::new(config),
        };

        Ok(Client {
            http,
            context,
            connection: Some(connection),
            resolve_gateway,
            handler,
            dispatch_rx: Some(dispatch_rx),
        })
    }
}

fn register_voice_listeners(listeners: &mut Listeners, voice: &Arc<VoiceRegistry>) {
    let registry = voice.clone();
    listeners.on_event("READY", move |ready: Ready| registry.set_user_id(ready.user.id));
    let registry = voice.clone();
    listeners.on_event("VOICE_STATE_UPDATE", move |update: VoiceStateUpdate| {
        registry.on_state_update(&update)
    });
    let registry = voice.clone();
    listeners.on_event("VOICE_SERVER_UPDATE", move |update: VoiceServerUpdate| {
        registry.on_server_update(&update)
    });
}

pub struct Client {
    pub(crate) http: Arc<Http>,
    context: Context,
    connection: Option<GatewayConnection>,
    resolve_gateway: bool,
    handler: Option<Arc<dyn EventHandler>>,
    dispatch_rx: Option<mpsc::UnboundedReceiver<(String, Value)>>,
}

impl Client {
    pub fn builder(token: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(token)
    }

    pub fn http(&self) -> &Arc<Http> {
        &self.http
    }

    pub fn context(&self) -> Context {
        self.context.clone()
    }

    pub fn gateway(&self) -> &GatewayHandle {
        &self.context.gateway
    }

    /// Runs the gateway until [`shutdown`](Self::shutdown) (`Ok`) or a close
    /// that can't be recovered from (`Err`).
    pub async fn start(&mut self) -> ClientResult<()> {
        let mut connection = self
            .connection
            .take()
            .ok_or_else(|| ClientError::protocol("client was already started"))?;

        if self.resolve_gateway {
            match self.http.get_gateway_bot().await {
                Ok(bot) => {
                    debug!(
                        "Gateway at {}, {} identifies left",
                        bot.url,
                        bot.session_start_limit
                            .as_ref()
                            .map_or(0, |limit| limit.remaining)
                    );
                    connection.set_gateway_url(bot.url);
                }
                Err(e) => warn!("Could not look up the gateway URL, using the default: {e}"),
            }
        }

        if let (Some(handler), Some(rx)) = (self.handler.clone(), self.dispatch_rx.take()) {
            tokio::spawn(run_handler(handler, self.context.clone(), rx));
        }

        info!("Starting gateway connection");
        connection.run().await
    }

    pub fn shutdown(&self) {
        self.context.gateway.shutdown();
    }
}

async fn run_handler(
    handler: Arc<dyn EventHandler>,
    ctx: Context,
    mut dispatches: mpsc::UnboundedReceiver<(String, Value)>,
) {
    while let Some((event, data)) = dispatches.recv().await {
        tokio::spawn(handle_dispatch(handler.clone(), ctx.clone(), event, data));
    }
    debug!("Event handler stopped");
}

async fn handle_dispatch(handler: Arc<dyn EventHandler>, ctx: Context, event: String, data: Value) {
    handler.on_dispatch(ctx.clone(), &event, &data).await;
    match event.as_str() {
        "READY" => {
            if let Some(ready) = decode::<Ready>(&event, data) {
                handler.on_ready(ctx, ready).await;
            }
        }
        "RESUMED" => handler.on_resumed(ctx).await,
        "MESSAGE_CREATE" => {
            if let Some(msg) = decode::<Message>(&event, data) {
                handler.on_message(ctx, msg).await;
            }
        }
        "GUILD_CREATE" => {
            if let Some(guild) = decode::<Guild>(&event, data) {
                handler.on_guild_create(ctx, guild).await;
            }
        }
        "VOICE_STATE_UPDATE" => {
            if let Some(state) = decode::<VoiceStateUpdate>(&event, data) {
                handler.on_voice_state_update(ctx, state).await;
            }
        }
        _ => {}
    }
}

fn decode<T: DeserializeOwned>(event: &str, data: Value) -> Option<T> {
    serde_json::from_value(data)
        .map_err(|e| debug!("Dropping {event} that failed to decode: {e}"))
        .ok()
}
