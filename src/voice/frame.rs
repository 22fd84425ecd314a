use std::time::Duration;

/// Opus clock rate; RTP timestamps count samples per channel at this rate.
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;

/// An Opus packet that decodes to silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Frames of silence sent when a playback ends, so the receiver's jitter
/// buffer doesn't interpolate over the gap.
pub const TRAILING_SILENCE_FRAMES: usize = 5;

/// Duration of one Opus frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameSize {
    #[default]
    Ms20,
    Ms40,
    Ms60,
}

impl FrameSize {
    pub const fn from_millis(ms: u32) -> Option<Self> {
        match ms {
            20 => Some(Self::Ms20),
            40 => Some(Self::Ms40),
            60 => Some(Self::Ms60),
            _ => None,
        }
    }

    pub const fn millis(self) -> u32 {
        match self {
            Self::Ms20 => 20,
            Self::Ms40 => 40,
            Self::Ms60 => 60,
        }
    }

    pub const fn duration(self) -> Duration {
        Duration::from_millis(self.millis() as u64)
    }

    /// RTP timestamp increment per frame.
    pub const fn samples(self) -> u32 {
        SAMPLE_RATE / 1_000 * self.millis()
    }
}
