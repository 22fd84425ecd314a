//! Runtime configuration.
//!
//! Everything has a default; [`ClientConfig::from_env`] reads overrides from
//! `FLUXER_*` variables and silently falls back when a value is missing or
//! doesn't parse.

use std::str::FromStr;
use std::time::Duration;

use crate::gateway::{ConnectionProperties, Intents};
use crate::voice::FrameSize;

pub const DEFAULT_API_URL: &str = "https://api.fluxer.app/v1";
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.fluxer.app";
pub const DEFAULT_GATEWAY_VERSION: u8 = 1;
pub const DEFAULT_VOICE_GATEWAY_VERSION: u8 = 8;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Replaced by whatever `/gateway/bot` returns when the client starts.
    pub url: String,
    pub version: u8,
    pub intents: Intents,
    /// `[shard_id, shard_count]`.
    pub shard: Option<[u32; 2]>,
    pub large_threshold: Option<u16>,
    pub properties: ConnectionProperties,
    pub auto_reconnect: bool,
    /// Consecutive failed reconnects before giving up. Reset on READY/RESUMED.
    pub max_reconnect_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            version: DEFAULT_GATEWAY_VERSION,
            intents: Intents::non_privileged() | Intents::MESSAGE_CONTENT,
            shard: None,
            large_threshold: Some(250),
            properties: ConnectionProperties::default(),
            auto_reconnect: true,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub api_url: String,
    /// Retries after a 502/525 before the request fails.
    pub transient_retries: u32,
    pub transient_retry_delay: Duration,
    /// Requests per second across every bucket.
    pub global_limit: u32,
    pub timeout: Duration,
    /// An empty bucket's task exits after this long without a request.
    pub bucket_idle_timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            transient_retries: 3,
            transient_retry_delay: Duration::from_millis(500),
            global_limit: 50,
            timeout: Duration::from_secs(30),
            bucket_idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub gateway_version: u8,
    pub frame_size: FrameSize,
    /// Encoder binary, looked up on `PATH` unless absolute.
    pub ffmpeg: String,
    pub bitrate_kbps: u32,
    pub discovery_attempts: u32,
    pub discovery_timeout: Duration,
    /// How long `join_voice` waits for the server/state update pair.
    pub join_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            gateway_version: DEFAULT_VOICE_GATEWAY_VERSION,
            frame_size: FrameSize::default(),
            ffmpeg: "ffmpeg".to_string(),
            bitrate_kbps: 128,
            discovery_attempts: 3,
            discovery_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub token: String,
    pub gateway: GatewayConfig,
    pub rest: RestConfig,
    pub voice: VoiceConfig,
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    /// `FLUXER_TOKEN`, `FLUXER_API_URL`, `FLUXER_INTENTS`, `FLUXER_SHARD`
    /// (`"id/count"`), `FLUXER_FFMPEG`.
    pub fn from_env() -> Self {
        let mut config = Self::new(std::env::var("FLUXER_TOKEN").unwrap_or_default());

        if let Ok(url) = std::env::var("FLUXER_API_URL") {
            config.rest.api_url = url;
        }
        config.gateway.intents = Intents::from_bits(env_parse(
            "FLUXER_INTENTS",
            config.gateway.intents.bits(),
        ));
        config.gateway.shard = std::env::var("FLUXER_SHARD")
            .ok()
            .and_then(|raw| parse_shard(&raw));
        if let Ok(ffmpeg) = std::env::var("FLUXER_FFMPEG") {
            config.voice.ffmpeg = ffmpeg;
        }
        config
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_shard(raw: &str) -> Option<[u32; 2]> {
    let (id, count) = raw.split_once('/')?;
    let id = id.trim().parse().ok()?;
    let count = count.trim().parse().ok()?;
    (count > 0 && id < count).then_some([id, count])
}
