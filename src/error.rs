//! Error types used across the library.

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

/// The error type returned by pretty much everything in the library.
///
/// You can match on the variant to figure out what went wrong. REST failures
/// show up as [`Api`](ClientError::Api) (the server said no) or
/// [`UpstreamTransient`](ClientError::UpstreamTransient) (the server kept
/// falling over). Gateway drops are handled by reconnecting; you only see
/// [`SessionTerminal`](ClientError::SessionTerminal) when the server closed
/// with a code that makes reconnecting pointless, like a bad token.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Not for bad status codes like 403 or 404 -- those show up as
    /// [`Api`](ClientError::Api). This is for transport-level stuff like
    /// DNS failures, TLS errors, timeouts, etc.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket-level failure that isn't tied to a specific library error,
    /// e.g. a stream that ended without a close frame.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected frame. Inside the gateway loop these are logged
    /// and dropped; they only surface from one-shot handshakes.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Recoverable close; the gateway reconnects on its own after this one.
    #[error("Connection closed with code {code}: {reason}")]
    ConnectionClosed { code: u16, reason: String },

    /// The server closed with a code that must not be retried (invalid token,
    /// invalid shard, disallowed intents, ...).
    #[error("Session terminated with code {code}: {reason}")]
    SessionTerminal { code: u16, reason: String },

    /// 502/525 that didn't go away after the configured retries.
    #[error("Upstream unavailable (HTTP {status}) after {attempts} attempts")]
    UpstreamTransient { status: u16, attempts: u32 },

    /// Any other non-success status. `body` is the raw response body, like
    /// `{"message": "Missing Permissions", "code": 50013}`.
    #[error("API error: HTTP {status} after {attempts} attempt(s): {body}")]
    Api {
        status: u16,
        body: String,
        attempts: u32,
    },

    /// Timeout waiting for `VOICE_SERVER_UPDATE`, discovery failure, voice
    /// gateway handshake problems, etc.
    #[error("Voice error: {0}")]
    Voice(String),

    /// The encoder process died or produced garbage. Only the playback that
    /// was running fails; the voice connection stays up.
    #[error("Audio pipeline error: {0}")]
    AudioPipeline(String),

    #[error("Client is shutting down")]
    ShuttingDown,
}

impl ClientError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn voice(message: impl Into<String>) -> Self {
        Self::Voice(message.into())
    }

    pub fn audio(message: impl Into<String>) -> Self {
        Self::AudioPipeline(message.into())
    }

    /// HTTP status for REST failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::UpstreamTransient { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// How many times the request went over the wire before giving up.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Api { attempts, .. } | Self::UpstreamTransient { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// `true` when retrying the same thing is never going to work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SessionTerminal { .. } | Self::Api { .. } | Self::ShuttingDown
        )
    }
}
