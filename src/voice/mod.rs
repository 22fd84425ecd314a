//! Voice: voice gateway handshake, UDP IP discovery, RTP + AEAD packets,
//! wall-clock frame pacing, and an ffmpeg-backed audio source.
//!
//! Join through [`Context::join_voice`](crate::client::Context::join_voice);
//! everything else hangs off the returned [`VoiceSession`].

mod connection;
pub mod crypto;
pub mod discovery;
mod frame;
pub mod ogg;
mod opcode;
mod pacer;
mod payload;
mod player;
mod registry;
pub mod rtp;
mod session;
mod source;
mod state;
mod udp;

pub use frame::{FrameSize, SAMPLE_RATE, SILENCE_FRAME, TRAILING_SILENCE_FRAMES};
pub use opcode::{classify_voice_close, is_dave_opcode, VoiceCloseCode, VoiceOpcode};
pub use pacer::FramePacer;
pub use payload::{SessionDescription, VoiceHello, VoicePayload, VoiceReady};
pub use player::{play, FrameSink, PlaybackControl, PlaybackSignals};
pub use registry::{VoiceCredentials, VoiceRegistry};
pub use session::VoiceSession;
pub use source::{EncoderOptions, FfmpegSource, FrameSource};
pub use state::VoiceConnectionState;
