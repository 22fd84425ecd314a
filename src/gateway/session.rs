use std::time::Duration;

use tokio::time::Instant;

/// Resumable gateway session. Lives across reconnects of one
/// [`GatewayConnection`](super::GatewayConnection); wiped on a
/// non-resumable close.
#[derive(Debug, Clone, Default)]
pub struct Session {
    id: Option<String>,
    sequence: Option<u64>,
    heartbeat_interval: Option<Duration>,
    last_ack_at: Option<Instant>,
    shard: Option<[u32; 2]>,
    resume_url: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on READY.
    pub fn start(&mut self, id: String, resume_url: Option<String>, shard: Option<[u32; 2]>) {
        self.id = Some(id);
        self.resume_url = resume_url;
        self.shard = shard;
    }

    /// `s` never goes backwards within a session, even if the server replays
    /// an older frame.
    pub fn observe_sequence(&mut self, s: Option<u64>) {
        if let Some(s) = s {
            self.sequence = Some(self.sequence.map_or(s, |current| current.max(s)));
        }
    }

    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = Some(interval);
    }

    pub fn record_ack(&mut self, at: Instant) {
        self.last_ack_at = Some(at);
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack_at
    }

    pub fn shard(&self) -> Option<[u32; 2]> {
        self.shard
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    pub fn can_resume(&self) -> bool {
        self.id.is_some()
    }

    pub fn invalidate(&mut self) {
        *self = Self::default();
    }
}
