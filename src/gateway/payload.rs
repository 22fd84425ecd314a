use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::opcode::{GatewayOpcode, Intents};
use crate::error::ClientResult;

/// The gateway wire envelope. Every frame in either direction is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl Payload {
    pub fn new(op: GatewayOpcode, d: Value) -> Self {
        Self {
            op: op.as_u8(),
            d,
            s: None,
            t: None,
        }
    }

    pub fn opcode(&self) -> Option<GatewayOpcode> {
        GatewayOpcode::from_u8(self.op)
    }

    pub fn encode(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> ClientResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(
            GatewayOpcode::Heartbeat,
            sequence.map_or(Value::Null, Value::from),
        )
    }

    pub fn identify(identify: &Identify) -> ClientResult<Self> {
        Ok(Self::new(GatewayOpcode::Identify, serde_json::to_value(identify)?))
    }

    pub fn resume(token: &str, session_id: &str, seq: u64) -> Self {
        Self::new(
            GatewayOpcode::Resume,
            json!({ "token": token, "session_id": session_id, "seq": seq }),
        )
    }

    /// Join, move or (with `channel_id: None`) leave a voice channel.
    pub fn voice_state_update(
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Self {
        Self::new(
            GatewayOpcode::VoiceStateUpdate,
            json!({
                "guild_id": guild_id,
                "channel_id": channel_id,
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        )
    }

    pub fn presence_update(status: &str, activity_name: Option<&str>, afk: bool) -> Self {
        let activities: Vec<Value> = activity_name
            .map(|name| json!({ "name": name, "type": 0 }))
            .into_iter()
            .collect();
        Self::new(
            GatewayOpcode::PresenceUpdate,
            json!({
                "since": null,
                "activities": activities,
                "status": status,
                "afk": afk,
            }),
        )
    }

    pub fn request_guild_members(guild_id: &str, query: &str, limit: u32) -> Self {
        Self::new(
            GatewayOpcode::RequestGuildMembers,
            json!({ "guild_id": guild_id, "query": query, "limit": limit }),
        )
    }
}

/// `d` of HELLO.
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "fluxer-runtime".to_string(),
            device: "fluxer-runtime".to_string(),
        }
    }
}

/// `d` of IDENTIFY.
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub intents: Intents,
    pub properties: ConnectionProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u16>,
}
