use rand::Rng;

pub const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 0x80;
const PAYLOAD_TYPE_OPUS: u8 = 0x78;

/// The fixed 12-byte RTP header: no padding, extension or CSRCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION;
        header[1] = PAYLOAD_TYPE_OPUS;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }
}

/// Hands out headers for consecutive frames. Both counters wrap.
#[derive(Debug, Clone)]
pub struct RtpSequencer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpSequencer {
    /// Starts from random sequence and timestamp values.
    pub fn new(ssrc: u32) -> Self {
        let mut rng = rand::rng();
        Self::starting_at(ssrc, rng.random(), rng.random())
    }

    pub fn starting_at(ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence,
            timestamp,
        }
    }

    /// Header for the next frame, which covers `samples` samples.
    pub fn advance(&mut self, samples: u32) -> RtpHeader {
        let header = RtpHeader {
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples);
        header
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}
