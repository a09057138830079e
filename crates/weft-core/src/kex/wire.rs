//! Key exchange packet layouts.
//!
//! Every kex packet starts with a zero channel byte (distinguishing it
//! from data packets, whose first byte is 1..255) followed by an 8-byte
//! magic. Body layouts are fixed-size except for the Initiate box, which
//! carries a variable payload.

use crate::error::KexError;

/// Channel byte reserved for key exchange traffic.
pub const KEX_CHANNEL: u8 = 0;

/// Hello packet magic.
pub const HELLO_MAGIC: [u8; 8] = *b"weftHELO";
/// Cookie packet magic.
pub const COOKIE_MAGIC: [u8; 8] = *b"weftCOOK";
/// Initiate packet magic.
pub const INITIATE_MAGIC: [u8; 8] = *b"weftINIT";
/// Probe packet magic.
pub const PROBE_MAGIC: [u8; 8] = *b"weftPROB";

/// Nonce domain prefix for the hello box.
pub const HELLO_NONCE_PREFIX: &[u8; 8] = b"weft-hl ";
/// Nonce domain prefix for the cookie packet box.
pub const COOKIE_NONCE_PREFIX: &[u8; 8] = b"weft-ck ";
/// Nonce domain prefix for the initiate box.
pub const INITIATE_NONCE_PREFIX: &[u8; 8] = b"weft-in ";
/// Nonce domain prefix for the vouch box.
pub const VOUCH_NONCE_PREFIX: &[u8; 8] = b"weft-vh ";

/// Hello box plaintext: 64 zero bytes proving possession of the
/// short-term secret key.
pub const HELLO_PADDING: usize = 64;

/// Size of the sealed hello box.
pub const HELLO_BOX_SIZE: usize = HELLO_PADDING + 16;

/// Size of the sealed cookie-packet box: server short-term pk + cookie.
pub const COOKIE_BOX_SIZE: usize = 32 + COOKIE_SIZE + 16;

/// Size of the opaque cookie: 16-byte nonce + 80-byte minute-sealed box.
pub const COOKIE_SIZE: usize = 96;

/// Minimum size of the sealed initiate box: long-term pk + vouch nonce +
/// vouch box + at least the one-byte channel payload.
pub const INITIATE_BOX_MIN_SIZE: usize = 32 + 16 + VOUCH_BOX_SIZE + 1 + 16;

/// Size of the sealed vouch box (a short-term public key).
pub const VOUCH_BOX_SIZE: usize = 32 + 16;

const HEADER_SIZE: usize = 1 + 8;

/// Extract the magic from a candidate kex packet (first byte zero).
#[must_use]
pub fn kex_magic(packet: &[u8]) -> Option<[u8; 8]> {
    if packet.len() < HEADER_SIZE || packet[0] != KEX_CHANNEL {
        return None;
    }
    packet[1..9].try_into().ok()
}

fn put_header(buf: &mut Vec<u8>, magic: &[u8; 8]) {
    buf.push(KEX_CHANNEL);
    buf.extend_from_slice(magic);
}

/// Copy the first `N` bytes of a length-checked slice into an array.
pub(crate) fn take<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Hello: initiator short-term pk, nonce, sealed possession proof.
#[derive(Debug, Clone)]
pub struct HelloPacket {
    /// Initiator's fresh short-term public key.
    pub initiator_short_pk: [u8; 32],
    /// Wire nonce of the hello box.
    pub nonce: [u8; 16],
    /// Sealed box of [`HELLO_PADDING`] zero bytes.
    pub sealed: [u8; HELLO_BOX_SIZE],
}

impl HelloPacket {
    /// Serialize.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 32 + 16 + HELLO_BOX_SIZE);
        put_header(&mut buf, &HELLO_MAGIC);
        buf.extend_from_slice(&self.initiator_short_pk);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.sealed);
        buf
    }

    /// Parse the body following the magic.
    ///
    /// # Errors
    ///
    /// [`KexError::Malformed`] on any length mismatch.
    pub fn decode(packet: &[u8]) -> Result<Self, KexError> {
        let body = packet
            .get(HEADER_SIZE..)
            .ok_or(KexError::Malformed)?;
        if body.len() != 32 + 16 + HELLO_BOX_SIZE {
            return Err(KexError::Malformed);
        }
        Ok(Self {
            initiator_short_pk: take(body),
            nonce: take(&body[32..]),
            sealed: take(&body[48..]),
        })
    }
}

/// Cookie: nonce plus a box (sealed to the initiator's short-term key)
/// containing the responder's short-term pk and the opaque cookie.
#[derive(Debug, Clone)]
pub struct CookiePacket {
    /// Wire nonce of the outer box.
    pub nonce: [u8; 16],
    /// Sealed responder short-term pk + cookie.
    pub sealed: [u8; COOKIE_BOX_SIZE],
}

impl CookiePacket {
    /// Serialize.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 16 + COOKIE_BOX_SIZE);
        put_header(&mut buf, &COOKIE_MAGIC);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.sealed);
        buf
    }

    /// Parse the body following the magic.
    ///
    /// # Errors
    ///
    /// [`KexError::Malformed`] on any length mismatch.
    pub fn decode(packet: &[u8]) -> Result<Self, KexError> {
        let body = packet
            .get(HEADER_SIZE..)
            .ok_or(KexError::Malformed)?;
        if body.len() != 16 + COOKIE_BOX_SIZE {
            return Err(KexError::Malformed);
        }
        Ok(Self {
            nonce: take(body),
            sealed: take(&body[16..]),
        })
    }
}

/// Initiate: short-term pk, echoed cookie, nonce, sealed identity box.
#[derive(Debug, Clone)]
pub struct InitiatePacket {
    /// Initiator's short-term public key (must match the cookie).
    pub initiator_short_pk: [u8; 32],
    /// The cookie exactly as received.
    pub cookie: [u8; COOKIE_SIZE],
    /// Wire nonce of the initiate box.
    pub nonce: [u8; 16],
    /// Sealed long-term pk + vouch + payload.
    pub sealed: Vec<u8>,
}

impl InitiatePacket {
    /// Serialize.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(HEADER_SIZE + 32 + COOKIE_SIZE + 16 + self.sealed.len());
        put_header(&mut buf, &INITIATE_MAGIC);
        buf.extend_from_slice(&self.initiator_short_pk);
        buf.extend_from_slice(&self.cookie);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.sealed);
        buf
    }

    /// Parse the body following the magic.
    ///
    /// # Errors
    ///
    /// [`KexError::Malformed`] on any length mismatch.
    pub fn decode(packet: &[u8]) -> Result<Self, KexError> {
        let body = packet
            .get(HEADER_SIZE..)
            .ok_or(KexError::Malformed)?;
        if body.len() < 32 + COOKIE_SIZE + 16 + INITIATE_BOX_MIN_SIZE {
            return Err(KexError::Malformed);
        }
        Ok(Self {
            initiator_short_pk: take(body),
            cookie: take(&body[32..]),
            nonce: take(&body[128..]),
            sealed: body[144..].to_vec(),
        })
    }
}

/// Serialize a probe packet (magic only).
#[must_use]
pub fn encode_probe() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    put_header(&mut buf, &PROBE_MAGIC);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrip() {
        let pkt = HelloPacket {
            initiator_short_pk: [1; 32],
            nonce: [2; 16],
            sealed: [3; HELLO_BOX_SIZE],
        };
        let wire = pkt.encode();
        assert_eq!(kex_magic(&wire), Some(HELLO_MAGIC));
        let back = HelloPacket::decode(&wire).unwrap();
        assert_eq!(back.initiator_short_pk, pkt.initiator_short_pk);
        assert_eq!(back.sealed, pkt.sealed);
    }

    #[test]
    fn initiate_roundtrip() {
        let pkt = InitiatePacket {
            initiator_short_pk: [1; 32],
            cookie: [2; COOKIE_SIZE],
            nonce: [3; 16],
            sealed: vec![4; INITIATE_BOX_MIN_SIZE],
        };
        let wire = pkt.encode();
        assert_eq!(kex_magic(&wire), Some(INITIATE_MAGIC));
        let back = InitiatePacket::decode(&wire).unwrap();
        assert_eq!(back.cookie, pkt.cookie);
        assert_eq!(back.sealed, pkt.sealed);
    }

    #[test]
    fn truncated_packets_rejected() {
        let wire = HelloPacket {
            initiator_short_pk: [1; 32],
            nonce: [2; 16],
            sealed: [3; HELLO_BOX_SIZE],
        }
        .encode();
        assert!(HelloPacket::decode(&wire[..wire.len() - 1]).is_err());
        assert!(CookiePacket::decode(&wire).is_err());
    }

    #[test]
    fn data_packets_are_not_kex() {
        assert_eq!(kex_magic(&[5, 0, 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(kex_magic(&[0, 1]), None);
    }
}
