use serde::{Deserialize, Serialize};

use super::Snowflake;

/// `VOICE_SERVER_UPDATE` dispatch: where to connect and with which token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: Snowflake,
    /// `None` while the server is being reallocated.
    pub endpoint: Option<String>,
}

/// `VOICE_STATE_UPDATE` dispatch. Ours carries the voice `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: Option<Snowflake>,
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
    pub session_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}
