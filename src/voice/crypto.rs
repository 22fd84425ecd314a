use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};

use super::rtp::RTP_HEADER_LEN;
use crate::error::{ClientError, ClientResult};

/// The only transport encryption mode this client speaks.
pub const ENCRYPTION_MODE: &str = "aead_aes256_gcm_rtpsize";
const KEY_LEN: usize = 32;
const NONCE_SUFFIX_LEN: usize = 4;

pub fn select_mode(offered: &[String]) -> ClientResult<&'static str> {
    if offered.iter().any(|mode| mode == ENCRYPTION_MODE) {
        Ok(ENCRYPTION_MODE)
    } else {
        Err(ClientError::voice(format!(
            "voice server offers no supported encryption mode: {offered:?}"
        )))
    }
}

/// Seals RTP payloads with the session key.
///
/// Packet layout: `header | ciphertext | tag | nonce counter (4 bytes BE)`.
/// The header is authenticated but not encrypted; the 12-byte AEAD nonce is
/// the counter followed by zeros.
pub struct PacketCipher {
    key: LessSafeKey,
    counter: u32,
}

impl PacketCipher {
    pub fn new(mode: &str, secret_key: &[u8]) -> ClientResult<Self> {
        if mode != ENCRYPTION_MODE {
            return Err(ClientError::voice(format!("unsupported encryption mode {mode}")));
        }
        if secret_key.len() != KEY_LEN {
            return Err(ClientError::voice(format!(
                "secret key must be {KEY_LEN} bytes, got {}",
                secret_key.len()
            )));
        }
        let key = UnboundKey::new(&AES_256_GCM, secret_key)
            .map_err(|_| ClientError::voice("rejected secret key"))?;
        Ok(Self {
            key: LessSafeKey::new(key),
            counter: 0,
        })
    }

    pub fn seal(&mut self, header: &[u8; RTP_HEADER_LEN], payload: &[u8]) -> ClientResult<Vec<u8>> {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);

        let mut body = payload.to_vec();
        self.key
            .seal_in_place_append_tag(nonce_for(counter), Aad::from(&header[..]), &mut body)
            .map_err(|_| ClientError::voice("failed to encrypt voice packet"))?;

        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + body.len() + NONCE_SUFFIX_LEN);
        packet.extend_from_slice(header);
        packet.extend_from_slice(&body);
        packet.extend_from_slice(&counter.to_be_bytes());
        Ok(packet)
    }
}

fn nonce_for(counter: u32) -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_SUFFIX_LEN].copy_from_slice(&counter.to_be_bytes());
    Nonce::assume_unique_for_key(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(key: &[u8], packet: &[u8]) -> Vec<u8> {
        let key = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, key).unwrap());
        let (header, rest) = packet.split_at(RTP_HEADER_LEN);
        let (sealed, suffix) = rest.split_at(rest.len() - NONCE_SUFFIX_LEN);
        let counter = u32::from_be_bytes(suffix.try_into().unwrap());
        let mut sealed = sealed.to_vec();
        key.open_in_place(nonce_for(counter), Aad::from(header), &mut sealed)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn sealed_packet_opens_with_the_same_key() {
        let key = [7u8; 32];
        let mut cipher = PacketCipher::new(ENCRYPTION_MODE, &key).unwrap();
        let header = [0x80, 0x78, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3];

        let first = cipher.seal(&header, b"opus-frame").unwrap();
        let second = cipher.seal(&header, b"opus-frame").unwrap();

        assert_eq!(&first[..RTP_HEADER_LEN], &header);
        assert_eq!(&first[first.len() - 4..], &0u32.to_be_bytes());
        assert_eq!(&second[second.len() - 4..], &1u32.to_be_bytes());
        assert_ne!(first, second);
        assert_eq!(open(&key, &first), b"opus-frame");
        assert_eq!(open(&key, &second), b"opus-frame");
    }

    #[test]
    fn rejects_bad_keys_and_modes() {
        assert!(PacketCipher::new(ENCRYPTION_MODE, &[0u8; 16]).is_err());
        assert!(PacketCipher::new("xsalsa20_poly1305", &[0u8; 32]).is_err());
        assert!(select_mode(&["xsalsa20_poly1305".into()]).is_err());
        assert_eq!(
            select_mode(&["xsalsa20_poly1305".into(), ENCRYPTION_MODE.into()]).unwrap(),
            ENCRYPTION_MODE
        );
    }
}
