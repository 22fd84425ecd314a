//! Just enough Ogg to pull Opus packets out of an encoder's stdout.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ClientError, ClientResult};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const PAGE_HEADER_LEN: usize = 27;
const OPUS_HEAD: &[u8] = b"OpusHead";
const OPUS_TAGS: &[u8] = b"OpusTags";

/// Reads Ogg pages and yields the Opus audio packets inside them, skipping
/// the `OpusHead`/`OpusTags` header packets. Packets spanning pages are
/// stitched back together.
pub struct OggReader<R> {
    reader: R,
    packets: VecDeque<Vec<u8>>,
    partial: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OggReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            packets: VecDeque::new(),
            partial: Vec::new(),
        }
    }

    /// `Ok(None)` once the stream ends cleanly on a page boundary.
    pub async fn next_packet(&mut self) -> ClientResult<Option<Vec<u8>>> {
        loop {
            while let Some(packet) = self.packets.pop_front() {
                if packet.starts_with(OPUS_HEAD) || packet.starts_with(OPUS_TAGS) {
                    continue;
                }
                return Ok(Some(packet));
            }
            if !self.read_page().await? {
                return Ok(None);
            }
        }
    }

    async fn read_page(&mut self) -> ClientResult<bool> {
        let mut header = [0u8; PAGE_HEADER_LEN];
        match read_full(&mut self.reader, &mut header).await? {
            0 => return Ok(false),
            PAGE_HEADER_LEN => {}
            n => return Err(ClientError::audio(format!("truncated Ogg page header ({n} bytes)"))),
        }
        if &header[..4] != CAPTURE_PATTERN {
            return Err(ClientError::audio("lost Ogg page sync"));
        }

        let segment_count = usize::from(header[26]);
        let mut lacing = vec![0u8; segment_count];
        self.reader.read_exact(&mut lacing).await.map_err(truncated)?;

        let body_len: usize = lacing.iter().map(|l| usize::from(*l)).sum();
        let mut body = vec![0u8; body_len];
        self.reader.read_exact(&mut body).await.map_err(truncated)?;

        let mut offset = 0;
        for len in lacing {
            let len = usize::from(len);
            self.partial.extend_from_slice(&body[offset..offset + len]);
            offset += len;
            // A lacing value below 255 ends the packet; 255 means it continues.
            if len < 255 {
                self.packets.push_back(std::mem::take(&mut self.partial));
            }
        }
        Ok(true)
    }
}

/// Like `read_exact`, but reports a clean EOF before the first byte as `0`.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> ClientResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn truncated(err: std::io::Error) -> ClientError {
    ClientError::audio(format!("truncated Ogg page: {err}"))
}
