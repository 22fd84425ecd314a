use std::time::Duration;

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{ClientError, ClientResult};

pub const DISCOVERY_PACKET_LEN: usize = 74;
const REQUEST_TYPE: u16 = 0x1;
const RESPONSE_TYPE: u16 = 0x2;
/// Length field: everything after type and length.
const BODY_LEN: u16 = 70;
const ADDRESS_RANGE: std::ops::Range<usize> = 8..72;

/// Our public address as the voice server sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAddress {
    pub ip: String,
    pub port: u16,
}

/// `type | length | ssrc | 64-byte address | port`, all big-endian, address
/// and port zeroed.
pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    packet[0..2].copy_from_slice(&REQUEST_TYPE.to_be_bytes());
    packet[2..4].copy_from_slice(&BODY_LEN.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

pub fn parse_discovery_response(packet: &[u8]) -> ClientResult<ExternalAddress> {
    if packet.len() < DISCOVERY_PACKET_LEN {
        return Err(ClientError::voice(format!(
            "discovery response too short: {} bytes",
            packet.len()
        )));
    }
    let kind = u16::from_be_bytes([packet[0], packet[1]]);
    if kind != RESPONSE_TYPE {
        return Err(ClientError::voice(format!(
            "unexpected discovery packet type {kind:#x}"
        )));
    }

    let address = &packet[ADDRESS_RANGE];
    let end = address.iter().position(|b| *b == 0).unwrap_or(address.len());
    let ip = std::str::from_utf8(&address[..end])
        .map_err(|_| ClientError::voice("discovery address is not UTF-8"))?
        .to_string();
    if ip.is_empty() {
        return Err(ClientError::voice("discovery response has no address"));
    }
    let port = u16::from_be_bytes([packet[72], packet[73]]);

    Ok(ExternalAddress { ip, port })
}

/// Sends the discovery packet on a connected socket until an answer comes
/// back, giving each attempt `per_attempt` to respond.
pub async fn discover(
    socket: &UdpSocket,
    ssrc: u32,
    attempts: u32,
    per_attempt: Duration,
) -> ClientResult<ExternalAddress> {
    let request = discovery_request(ssrc);
    let mut buf = [0u8; 128];

    for attempt in 1..=attempts.max(1) {
        debug!("IP discovery attempt {attempt}/{attempts}");
        socket.send(&request).await?;

        match timeout(per_attempt, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => match parse_discovery_response(&buf[..len]) {
                Ok(address) => {
                    debug!("Discovered external address {}:{}", address.ip, address.port);
                    return Ok(address);
                }
                Err(e) => warn!("Ignoring bad discovery response: {e}"),
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => warn!("IP discovery attempt {attempt} timed out"),
        }
    }

    Err(ClientError::voice(format!(
        "IP discovery failed after {} attempts",
        attempts.max(1)
    )))
}
