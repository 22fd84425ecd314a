use std::fmt;

/// Lifecycle of one voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceConnectionState {
    #[default]
    Idle,
    AwaitingVoiceServerUpdate,
    ConnectingUdp,
    Discovering,
    Ready,
    Speaking,
    Silent,
    Disconnected,
}

impl VoiceConnectionState {
    /// Ready to play, whether or not something is playing right now.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Speaking | Self::Silent)
    }

    pub fn is_disconnected(self) -> bool {
        self == Self::Disconnected
    }
}

impl fmt::Display for VoiceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingVoiceServerUpdate => "awaiting voice server update",
            Self::ConnectingUdp => "connecting UDP",
            Self::Discovering => "discovering",
            Self::Ready => "ready",
            Self::Speaking => "speaking",
            Self::Silent => "silent",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
