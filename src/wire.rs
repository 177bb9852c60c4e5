//! Just enough of the BitTorrent peer wire protocol to pull data from a
//! single peer: handshake, interested and block requests. All integers are
//! big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use rand::distr::Alphanumeric;

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;
pub const BLOCK_LEN: u32 = 16 * 1024;
/// Largest frame a single request can produce: a `piece` header plus one block.
pub const MAX_PIECE_FRAME: usize = BLOCK_LEN as usize + 13;

const MSG_INTERESTED: u8 = 2;
const MSG_REQUEST: u8 = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("handshake too short: {0} bytes")]
    ShortHandshake(usize),
    #[error("peer speaks a different protocol")]
    BadProtocol,
    #[error("peer answered for a different info hash")]
    InfoHashMismatch,
    #[error("info hash is not 40 hex characters")]
    BadInfoHash,
}

pub fn handshake(info_hash: &[u8; 20], peer_id: &[u8; 20]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
    buf.put_u8(PROTOCOL.len() as u8);
    buf.put_slice(PROTOCOL);
    buf.put_bytes(0, 8);
    buf.put_slice(info_hash);
    buf.put_slice(peer_id);
    buf.freeze()
}

/// Checks the length byte, protocol string and info hash of a peer's reply.
/// Reserved bits and the peer id are ignored.
pub fn validate_handshake(resp: &[u8], info_hash: &[u8; 20]) -> Result<(), WireError> {
    if resp.len() < HANDSHAKE_LEN {
        return Err(WireError::ShortHandshake(resp.len()));
    }
    if resp[0] as usize != PROTOCOL.len() || &resp[1..20] != PROTOCOL {
        return Err(WireError::BadProtocol);
    }
    if &resp[28..48] != info_hash {
        return Err(WireError::InfoHashMismatch);
    }
    Ok(())
}

pub fn interested() -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(1);
    buf.put_u8(MSG_INTERESTED);
    buf.freeze()
}

pub fn request(index: u32, begin: u32, length: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_u32(13);
    buf.put_u8(MSG_REQUEST);
    buf.put_u32(index);
    buf.put_u32(begin);
    buf.put_u32(length);
    buf.freeze()
}

/// Client signature prefix padded to 20 bytes with random alphanumerics.
pub fn peer_id(prefix: &str) -> [u8; 20] {
    let mut out = [0u8; 20];
    let prefix = &prefix.as_bytes()[..prefix.len().min(20)];
    out[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    for b in out[prefix.len()..].iter_mut() {
        *b = rng.sample(Alphanumeric);
    }
    out
}

pub fn info_hash_bytes(hex_hash: &str) -> Result<[u8; 20], WireError> {
    let bytes = hex::decode(hex_hash.trim()).map_err(|_| WireError::BadInfoHash)?;
    bytes.try_into().map_err(|_| WireError::BadInfoHash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: [u8; 20] = [0xab; 20];

    #[test]
    fn handshake_layout() {
        let id = peer_id("-qB4650-");
        let hs = handshake(&HASH, &id);
        assert_eq!(hs.len(), 68);
        assert_eq!(hs[0], 19);
        assert_eq!(&hs[1..20], PROTOCOL);
        assert_eq!(&hs[20..28], &[0u8; 8]);
        assert_eq!(&hs[28..48], &HASH);
        assert_eq!(&hs[48..68], &id);
        assert_eq!(validate_handshake(&hs, &HASH), Ok(()));
    }

    #[test]
    fn handshake_validation_failures() {
        let hs = handshake(&HASH, &[b'x'; 20]);
        assert_eq!(
            validate_handshake(&hs[..40], &HASH),
            Err(WireError::ShortHandshake(40))
        );
        assert_eq!(
            validate_handshake(&hs, &[0u8; 20]),
            Err(WireError::InfoHashMismatch)
        );
        let mut bad = hs.to_vec();
        bad[5] = b'X';
        assert_eq!(validate_handshake(&bad, &HASH), Err(WireError::BadProtocol));
    }

    #[test]
    fn message_frames() {
        assert_eq!(&interested()[..], &[0, 0, 0, 1, 2]);
        let req = request(0, 0, BLOCK_LEN);
        assert_eq!(req.len(), 17);
        assert_eq!(&req[..5], &[0, 0, 0, 13, 6]);
        assert_eq!(&req[13..], &[0, 0, 0x40, 0]);
    }

    #[test]
    fn peer_id_keeps_prefix_and_is_printable() {
        let id = peer_id("-qB4650-");
        assert!(id.starts_with(b"-qB4650-"));
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(peer_id("-qB4650-"), id);
    }

    #[test]
    fn info_hash_hex_round_trip() {
        let hex_hash = hex::encode(HASH);
        assert_eq!(info_hash_bytes(&hex_hash), Ok(HASH));
        assert_eq!(info_hash_bytes("abc"), Err(WireError::BadInfoHash));
        assert_eq!(info_hash_bytes(&"zz".repeat(20)), Err(WireError::BadInfoHash));
    }
}
