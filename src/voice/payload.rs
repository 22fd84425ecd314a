use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::opcode::VoiceOpcode;
use crate::error::ClientResult;

/// Voice gateway envelope. Server messages carry `seq` from v8 on; it is
/// echoed back as `seq_ack` in heartbeats and RESUME.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoicePayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl VoicePayload {
    pub fn new(op: VoiceOpcode, d: Value) -> Self {
        Self {
            op: op.as_u8(),
            d,
            seq: None,
        }
    }

    pub fn opcode(&self) -> Option<VoiceOpcode> {
        VoiceOpcode::from_u8(self.op)
    }

    pub fn encode(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> ClientResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn identify(server_id: &str, user_id: &str, session_id: &str, token: &str) -> Self {
        Self::new(
            VoiceOpcode::Identify,
            json!({
                "server_id": server_id,
                "user_id": user_id,
                "session_id": session_id,
                "token": token,
                "max_dave_protocol_version": 0,
            }),
        )
    }

    pub fn select_protocol(address: &str, port: u16, mode: &str) -> Self {
        Self::new(
            VoiceOpcode::SelectProtocol,
            json!({
                "protocol": "udp",
                "data": { "address": address, "port": port, "mode": mode },
            }),
        )
    }

    pub fn heartbeat(nonce: u64, seq_ack: Option<u64>) -> Self {
        Self::new(
            VoiceOpcode::Heartbeat,
            json!({ "t": nonce, "seq_ack": seq_ack }),
        )
    }

    pub fn speaking(ssrc: u32, speaking: bool) -> Self {
        Self::new(
            VoiceOpcode::Speaking,
            json!({ "speaking": u8::from(speaking), "delay": 0, "ssrc": ssrc }),
        )
    }

    pub fn resume(server_id: &str, session_id: &str, token: &str, seq_ack: Option<u64>) -> Self {
        Self::new(
            VoiceOpcode::Resume,
            json!({
                "server_id": server_id,
                "session_id": session_id,
                "token": token,
                "seq_ack": seq_ack,
            }),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceHello {
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HeartbeatAck {
    #[serde(default)]
    pub t: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_seq_is_optional() {
        let hello = VoicePayload::decode(r#"{"op":8,"d":{"heartbeat_interval":13750.0}}"#).unwrap();
        assert_eq!(hello.opcode(), Some(VoiceOpcode::Hello));
        assert_eq!(hello.seq, None);
        let hello = VoiceHello::deserialize(&hello.d).unwrap();
        assert_eq!(hello.heartbeat_interval, 13750.0);

        let ready = VoicePayload::decode(
            r#"{"op":2,"seq":3,"d":{"ssrc":7,"ip":"10.0.0.1","port":50000,"modes":["aead_aes256_gcm_rtpsize"]}}"#,
        )
        .unwrap();
        assert_eq!(ready.seq, Some(3));
        let ready = VoiceReady::deserialize(&ready.d).unwrap();
        assert_eq!(ready.ssrc, 7);
        assert_eq!(ready.port, 50000);
    }

    #[test]
    fn outbound_shapes() {
        let beat = VoicePayload::heartbeat(1234, Some(9));
        assert_eq!(beat.op, 3);
        assert_eq!(beat.d, json!({ "t": 1234, "seq_ack": 9 }));
        assert!(!beat.encode().unwrap().contains("\"seq\""));

        let speaking = VoicePayload::speaking(42, true);
        assert_eq!(speaking.d["speaking"], json!(1));
        assert_eq!(speaking.d["ssrc"], json!(42));

        let select = VoicePayload::select_protocol("1.2.3.4", 5000, "aead_aes256_gcm_rtpsize");
        assert_eq!(select.d["data"]["port"], json!(5000));
    }

    #[test]
    fn session_description_key() {
        let d = json!({ "mode": "aead_aes256_gcm_rtpsize", "secret_key": [1, 2, 3] });
        let description = SessionDescription::deserialize(&d).unwrap();
        assert_eq!(description.secret_key, vec![1, 2, 3]);
    }
}
