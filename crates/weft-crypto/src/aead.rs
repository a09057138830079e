//! `XChaCha20-Poly1305` AEAD encryption.
//!
//! The 24-byte extended nonce leaves room for an 8-byte per-session base
//! plus a 64-bit packet sequence number, so channel nonces are unique by
//! construction and never random.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

use crate::{CryptoError, AEAD_KEY_SIZE, AEAD_NONCE_SIZE};

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; AEAD_NONCE_SIZE]);

impl Nonce {
    /// Build a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; AEAD_NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a channel packet nonce: `base(8) ∥ pktseq be64 ∥ zero(8)`.
    ///
    /// `pktseq` is strictly monotonic per channel direction, so a given
    /// (key, nonce) pair is never reused.
    #[must_use]
    pub fn for_packet(base: &[u8; 8], pktseq: u64) -> Self {
        let mut bytes = [0u8; AEAD_NONCE_SIZE];
        bytes[..8].copy_from_slice(base);
        bytes[8..16].copy_from_slice(&pktseq.to_be_bytes());
        Self(bytes)
    }

    /// Build a kex packet nonce: an 8-byte ASCII domain prefix plus the
    /// 16 bytes that travel on the wire.
    #[must_use]
    pub fn with_prefix(prefix: &[u8; 8], wire: &[u8; 16]) -> Self {
        let mut bytes = [0u8; AEAD_NONCE_SIZE];
        bytes[..8].copy_from_slice(prefix);
        bytes[8..].copy_from_slice(wire);
        Self(bytes)
    }

    /// Generate random wire-nonce bytes for a kex packet.
    #[must_use]
    pub fn random_wire<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; 16] {
        let mut wire = [0u8; 16];
        rng.fill_bytes(&mut wire);
        wire
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; AEAD_NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &XNonce {
        XNonce::from_slice(&self.0)
    }
}

/// AEAD encryption key (32 bytes), zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; AEAD_KEY_SIZE]);

impl AeadKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; AEAD_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; AEAD_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; AEAD_KEY_SIZE] {
        &self.0
    }

    /// Encrypt `plaintext`, authenticating `aad` alongside it. The 16-byte
    /// tag is appended to the returned ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the cipher rejects the
    /// input (only possible for absurd plaintext lengths).
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.0));
        cipher
            .encrypt(
                nonce.as_generic(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate. Fails without detail on any mismatch.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthenticationFailed`] if the tag does not
    /// verify under this key, nonce, and associated data.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.0));
        cipher
            .decrypt(
                nonce.as_generic(),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn roundtrip_with_aad() {
        let key = AeadKey::generate(&mut OsRng);
        let nonce = Nonce::for_packet(b"basebase", 7);

        let ct = key.encrypt(&nonce, b"payload", b"header").unwrap();
        assert_eq!(ct.len(), 7 + crate::TAG_SIZE);

        let pt = key.decrypt(&nonce, &ct, b"header").unwrap();
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn tampered_aad_rejected() {
        let key = AeadKey::generate(&mut OsRng);
        let nonce = Nonce::for_packet(b"basebase", 7);

        let ct = key.encrypt(&nonce, b"payload", b"header").unwrap();
        assert!(key.decrypt(&nonce, &ct, b"headex").is_err());
    }

    #[test]
    fn packet_nonces_differ_by_sequence() {
        let a = Nonce::for_packet(b"basebase", 1);
        let b = Nonce::for_packet(b"basebase", 2);
        assert_ne!(a, b);
    }
}
