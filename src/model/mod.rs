//! Payload containers for the handful of entities the runtime itself needs
//! to read. Unknown fields are ignored, missing optional ones default.

pub mod voice;

use serde::{Deserialize, Serialize};

pub use voice::{VoiceServerUpdate, VoiceStateUpdate};

pub type Snowflake = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    #[serde(default)]
    pub username: String,
    pub discriminator: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub id: Snowflake,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub owner_id: Option<Snowflake>,
    pub member_count: Option<u64>,
    #[serde(default)]
    pub unavailable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Snowflake,
    #[serde(rename = "type")]
    pub kind: Option<u8>,
    pub guild_id: Option<Snowflake>,
    pub name: Option<String>,
    pub bitrate: Option<u64>,
    pub user_limit: Option<u64>,
    pub parent_id: Option<Snowflake>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelType {
    Text = 0,
    Dm = 1,
    Voice = 2,
    GroupDm = 3,
    Category = 4,
    Announcement = 5,
    Stage = 13,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Option<Snowflake>,
    pub guild_id: Option<Snowflake>,
    pub author: User,
    pub content: Option<String>,
    pub timestamp: Option<String>,
    pub edited_timestamp: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    pub v: Option<u64>,
    pub session_id: String,
    pub resume_gateway_url: Option<String>,
    pub user: User,
    pub guilds: Option<Vec<UnavailableGuild>>,
    pub shard: Option<[u32; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,
    pub unavailable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayResponse {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBotResponse {
    pub url: String,
    pub shards: Option<u32>,
    pub session_start_limit: Option<SessionStartLimit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    pub max_concurrency: u32,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ready_tolerates_sparse_payloads() {
        let ready: Ready = serde_json::from_value(json!({
            "session_id": "abc",
            "user": { "id": "1" },
            "shard": [0, 2],
            "something_new": true
        }))
        .unwrap();
        assert_eq!(ready.session_id, "abc");
        assert_eq!(ready.user.username, "");
        assert_eq!(ready.shard, Some([0, 2]));
        assert!(ready.resume_gateway_url.is_none());
    }

    #[test]
    fn message_kind_is_renamed() {
        let message: Message = serde_json::from_value(json!({
            "id": "5",
            "author": { "id": "1", "username": "someone" },
            "content": "hello",
            "type": 0
        }))
        .unwrap();
        assert_eq!(message.kind, Some(0));
        assert_eq!(message.content.as_deref(), Some("hello"));
    }
}
