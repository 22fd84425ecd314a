use crate::gateway::CloseAction;

/// Voice gateway opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VoiceOpcode {
    Identify = 0,
    SelectProtocol = 1,
    Ready = 2,
    Heartbeat = 3,
    SessionDescription = 4,
    Speaking = 5,
    HeartbeatAck = 6,
    Resume = 7,
    Hello = 8,
    Resumed = 9,
    ClientsConnect = 11,
    ClientDisconnect = 13,
}

impl VoiceOpcode {
    pub const fn from_u8(op: u8) -> Option<Self> {
        match op {
            0 => Some(Self::Identify),
            1 => Some(Self::SelectProtocol),
            2 => Some(Self::Ready),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::SessionDescription),
            5 => Some(Self::Speaking),
            6 => Some(Self::HeartbeatAck),
            7 => Some(Self::Resume),
            8 => Some(Self::Hello),
            9 => Some(Self::Resumed),
            11 => Some(Self::ClientsConnect),
            13 => Some(Self::ClientDisconnect),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// End-to-end encryption group-key ops. Recognized so they can be skipped
/// quietly; this client never negotiates DAVE.
pub const fn is_dave_opcode(op: u8) -> bool {
    matches!(op, 21..=31)
}

/// Voice gateway close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCloseCode {
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    SessionNoLongerValid = 4006,
    SessionTimeout = 4009,
    ServerNotFound = 4011,
    UnknownProtocol = 4012,
    Disconnected = 4014,
    VoiceServerCrashed = 4015,
    UnknownEncryptionMode = 4016,
    E2eeRequired = 4017,
    BadRequest = 4020,
    RateLimited = 4021,
    CallTerminated = 4022,
}

impl VoiceCloseCode {
    pub const fn from_u16(code: u16) -> Option<Self> {
        match code {
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4006 => Some(Self::SessionNoLongerValid),
            4009 => Some(Self::SessionTimeout),
            4011 => Some(Self::ServerNotFound),
            4012 => Some(Self::UnknownProtocol),
            4014 => Some(Self::Disconnected),
            4015 => Some(Self::VoiceServerCrashed),
            4016 => Some(Self::UnknownEncryptionMode),
            4017 => Some(Self::E2eeRequired),
            4020 => Some(Self::BadRequest),
            4021 => Some(Self::RateLimited),
            4022 => Some(Self::CallTerminated),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::SessionNoLongerValid
                | Self::ServerNotFound
                | Self::UnknownProtocol
                | Self::Disconnected
                | Self::UnknownEncryptionMode
                | Self::CallTerminated
        )
    }
}

/// Same split as the main gateway, minus re-identify: a voice session that
/// can't resume has to be joined again from scratch.
pub fn classify_voice_close(code: u16) -> CloseAction {
    match VoiceCloseCode::from_u16(code) {
        Some(code) if code.is_terminal() => CloseAction::Terminal,
        _ => CloseAction::Resume,
    }
}
