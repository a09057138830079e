//! Channel packet armor.
//!
//! Armor encrypts and authenticates one channel packet per call. The first
//! four bytes of the packet (channel number and the low 24 bits of the
//! transmit sequence) must stay in the clear so the receiving socket can
//! demultiplex; they are bound into the authentication tag as associated
//! data. Everything from byte 4 onward is encrypted, and the 16-byte tag is
//! appended.

use weft_crypto::aead::{AeadKey, Nonce};
use weft_crypto::kdf::SessionKeySet;
use weft_crypto::{CryptoError, TAG_SIZE};

use crate::channel::CHANNEL_HEADER_SIZE;

/// Number of leading packet bytes left in the clear.
pub const CLEAR_PREFIX_SIZE: usize = 4;

/// Encrypt/authenticate outbound packets and verify inbound ones.
///
/// Implementations derive the nonce deterministically from the packet
/// sequence; the same (key, nonce) pair never encrypts two plaintexts
/// because sequences are strictly monotonic.
pub trait ChannelArmor: Send {
    /// Encode the plaintext packet for transmission at `pktseq`.
    ///
    /// # Errors
    ///
    /// Propagates AEAD failure (practically unreachable for valid sizes).
    fn transmit_encode(&self, pktseq: u64, packet: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verify and decrypt a received packet claimed to be at `pktseq`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthenticationFailed`] for forged, corrupted,
    /// or mis-sequenced packets. Callers drop such packets without
    /// consuming replay-window state.
    fn receive_decode(&self, pktseq: u64, packet: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// The stock armor: XChaCha20-Poly1305 under the session key set.
pub struct SecretboxArmor {
    tx_key: AeadKey,
    rx_key: AeadKey,
    tx_nonce_base: [u8; 8],
    rx_nonce_base: [u8; 8],
}

impl SecretboxArmor {
    /// Build armor from a derived session key set.
    #[must_use]
    pub fn new(keys: &SessionKeySet) -> Self {
        Self {
            tx_key: AeadKey::new(keys.tx.key),
            rx_key: AeadKey::new(keys.rx.key),
            tx_nonce_base: keys.tx.nonce_base,
            rx_nonce_base: keys.rx.nonce_base,
        }
    }
}

impl ChannelArmor for SecretboxArmor {
    fn transmit_encode(&self, pktseq: u64, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        debug_assert!(packet.len() >= CHANNEL_HEADER_SIZE);
        let (clear, secret) = packet.split_at(CLEAR_PREFIX_SIZE);
        let nonce = Nonce::for_packet(&self.tx_nonce_base, pktseq);
        let sealed = self.tx_key.encrypt(&nonce, secret, clear)?;

        let mut out = Vec::with_capacity(packet.len() + TAG_SIZE);
        out.extend_from_slice(clear);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn receive_decode(&self, pktseq: u64, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if packet.len() < CLEAR_PREFIX_SIZE + TAG_SIZE {
            return Err(CryptoError::BoxTooShort);
        }
        let (clear, sealed) = packet.split_at(CLEAR_PREFIX_SIZE);
        let nonce = Nonce::for_packet(&self.rx_nonce_base, pktseq);
        let opened = self.rx_key.decrypt(&nonce, sealed, clear)?;

        let mut out = Vec::with_capacity(CLEAR_PREFIX_SIZE + opened.len());
        out.extend_from_slice(clear);
        out.extend_from_slice(&opened);
        Ok(out)
    }
}

/// Pass-through armor for channel-engine unit tests: appends/strips a fake
/// tag of zeros and performs no cryptography.
pub struct NullArmor;

impl ChannelArmor for NullArmor {
    fn transmit_encode(&self, _pktseq: u64, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = packet.to_vec();
        out.extend_from_slice(&[0u8; TAG_SIZE]);
        Ok(out)
    }

    fn receive_decode(&self, _pktseq: u64, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if packet.len() < TAG_SIZE {
            return Err(CryptoError::BoxTooShort);
        }
        Ok(packet[..packet.len() - TAG_SIZE].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use weft_crypto::x25519::Keypair;

    fn key_sets() -> (SessionKeySet, SessionKeySet) {
        let init = Keypair::generate(&mut OsRng);
        let resp = Keypair::generate(&mut OsRng);
        let a = SessionKeySet::derive(
            init.secret(),
            &resp.public(),
            &init.public(),
            &resp.public(),
            true,
        )
        .unwrap();
        let b = SessionKeySet::derive(
            resp.secret(),
            &init.public(),
            &init.public(),
            &resp.public(),
            false,
        )
        .unwrap();
        (a, b)
    }

    #[test]
    fn encode_decode_across_sides() {
        let (ka, kb) = key_sets();
        let alice = SecretboxArmor::new(&ka);
        let bob = SecretboxArmor::new(&kb);

        let mut packet = vec![0u8; CHANNEL_HEADER_SIZE];
        packet[0] = 5;
        packet.extend_from_slice(b"stream frame bytes");

        let wire = alice.transmit_encode(9, &packet).unwrap();
        assert_eq!(&wire[..CLEAR_PREFIX_SIZE], &packet[..CLEAR_PREFIX_SIZE]);
        assert_ne!(&wire[CLEAR_PREFIX_SIZE..packet.len()], &packet[CLEAR_PREFIX_SIZE..]);

        let opened = bob.receive_decode(9, &wire).unwrap();
        assert_eq!(opened, packet);
    }

    #[test]
    fn wrong_sequence_fails_authentication() {
        let (ka, kb) = key_sets();
        let alice = SecretboxArmor::new(&ka);
        let bob = SecretboxArmor::new(&kb);

        let mut packet = vec![0u8; CHANNEL_HEADER_SIZE];
        packet.extend_from_slice(b"payload");
        let wire = alice.transmit_encode(3, &packet).unwrap();
        assert!(bob.receive_decode(4, &wire).is_err());
    }

    #[test]
    fn tampered_clear_prefix_fails_authentication() {
        let (ka, kb) = key_sets();
        let alice = SecretboxArmor::new(&ka);
        let bob = SecretboxArmor::new(&kb);

        let mut packet = vec![0u8; CHANNEL_HEADER_SIZE];
        packet.extend_from_slice(b"payload");
        let mut wire = alice.transmit_encode(3, &packet).unwrap();
        wire[1] ^= 0x01;
        assert!(bob.receive_decode(3, &wire).is_err());
    }
}
