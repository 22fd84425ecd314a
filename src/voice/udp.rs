use async_trait::async_trait;
use log::trace;
use tokio::net::UdpSocket;

use super::connection::ControlHandle;
use super::crypto::PacketCipher;
use super::frame::FrameSize;
use super::player::FrameSink;
use super::rtp::RtpSequencer;
use crate::error::ClientResult;

/// Encrypts frames onto the voice socket. Sequence, timestamp and nonce
/// state live here so they carry over from one playback to the next.
pub(crate) struct UdpSink {
    socket: UdpSocket,
    sequencer: RtpSequencer,
    cipher: PacketCipher,
    control: ControlHandle,
    speaking: bool,
}

impl UdpSink {
    pub(crate) fn new(
        socket: UdpSocket,
        ssrc: u32,
        cipher: PacketCipher,
        control: ControlHandle,
    ) -> Self {
        Self {
            socket,
            sequencer: RtpSequencer::new(ssrc),
            cipher,
            control,
            speaking: false,
        }
    }
}

#[async_trait]
impl FrameSink for UdpSink {
    async fn send_frame(&mut self, opus: &[u8], frame: FrameSize) -> ClientResult<()> {
        let header = self.sequencer.advance(frame.samples());
        let packet = self.cipher.seal(&header.to_bytes(), opus)?;
        trace!("RTP seq {} ts {} ({} bytes)", header.sequence, header.timestamp, packet.len());
        self.socket.send(&packet).await?;
        Ok(())
    }

    async fn set_speaking(&mut self, speaking: bool) -> ClientResult<()> {
        if self.speaking == speaking {
            return Ok(());
        }
        self.control.set_speaking(speaking).await?;
        self.speaking = speaking;
        Ok(())
    }
}
