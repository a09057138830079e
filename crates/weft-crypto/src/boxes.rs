//! Public-key sealed boxes for key-exchange packets.
//!
//! A box from sender S to receiver R is XChaCha20-Poly1305 under a key
//! derived from the X25519 agreement of S's secret and R's public key:
//!
//! ```text
//! box_key = blake3::derive_key("weft box v1", x25519(s_sk, r_pk))
//! ```
//!
//! Either side can open a box the other sealed; who sealed it is bound by
//! the key derivation, not by the box contents. Box nonces are a domain
//! prefix plus 16 wire bytes, so every packet type lives in its own nonce
//! space.

use rand_core::{CryptoRng, RngCore};

use crate::aead::{AeadKey, Nonce};
use crate::x25519::{PublicKey, SecretKey};
use crate::{CryptoError, TAG_SIZE};

const BOX_KDF_CONTEXT: &str = "weft box v1";

/// A precomputed box key between one local secret key and one remote
/// public key. Reusable across packets; zeroized when dropped.
pub struct BoxKey {
    key: AeadKey,
}

impl BoxKey {
    /// Derive the shared box key.
    ///
    /// # Errors
    ///
    /// Fails if the remote public key is a low-order point.
    pub fn derive(local: &SecretKey, remote: &PublicKey) -> Result<Self, CryptoError> {
        let shared = local.exchange(remote)?;
        let key = blake3::derive_key(BOX_KDF_CONTEXT, shared.as_bytes());
        Ok(Self {
            key: AeadKey::new(key),
        })
    }

    /// Seal `plaintext` under this key and the prefixed nonce.
    ///
    /// # Errors
    ///
    /// Propagates AEAD encryption failure.
    pub fn seal(
        &self,
        prefix: &[u8; 8],
        wire_nonce: &[u8; 16],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::with_prefix(prefix, wire_nonce);
        self.key.encrypt(&nonce, plaintext, &[])
    }

    /// Open a sealed box.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BoxTooShort`] for runt input and
    /// [`CryptoError::AuthenticationFailed`] when the tag does not verify.
    pub fn open(
        &self,
        prefix: &[u8; 8],
        wire_nonce: &[u8; 16],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < TAG_SIZE {
            return Err(CryptoError::BoxTooShort);
        }
        let nonce = Nonce::with_prefix(prefix, wire_nonce);
        self.key.decrypt(&nonce, sealed, &[])
    }
}

/// Seal a one-shot box, deriving the key and generating the wire nonce.
/// Returns `(wire_nonce, sealed)`.
///
/// # Errors
///
/// Fails on low-order remote keys or AEAD failure.
pub fn seal<R: RngCore + CryptoRng>(
    rng: &mut R,
    local: &SecretKey,
    remote: &PublicKey,
    prefix: &[u8; 8],
    plaintext: &[u8],
) -> Result<([u8; 16], Vec<u8>), CryptoError> {
    let key = BoxKey::derive(local, remote)?;
    let wire_nonce = Nonce::random_wire(rng);
    let sealed = key.seal(prefix, &wire_nonce, plaintext)?;
    Ok((wire_nonce, sealed))
}

/// Open a one-shot box.
///
/// # Errors
///
/// Fails on low-order remote keys, runt input, or authentication failure.
pub fn open(
    local: &SecretKey,
    remote: &PublicKey,
    prefix: &[u8; 8],
    wire_nonce: &[u8; 16],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    BoxKey::derive(local, remote)?.open(prefix, wire_nonce, sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x25519::Keypair;
    use rand_core::OsRng;

    const PREFIX: &[u8; 8] = b"weft-ts ";

    #[test]
    fn seal_open_across_sides() {
        let alice = Keypair::generate(&mut OsRng);
        let bob = Keypair::generate(&mut OsRng);

        let (nonce, sealed) =
            seal(&mut OsRng, alice.secret(), &bob.public(), PREFIX, b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + TAG_SIZE);

        let opened = open(bob.secret(), &alice.public(), PREFIX, &nonce, &sealed).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn wrong_recipient_fails() {
        let alice = Keypair::generate(&mut OsRng);
        let bob = Keypair::generate(&mut OsRng);
        let eve = Keypair::generate(&mut OsRng);

        let (nonce, sealed) =
            seal(&mut OsRng, alice.secret(), &bob.public(), PREFIX, b"hello").unwrap();
        assert!(open(eve.secret(), &alice.public(), PREFIX, &nonce, &sealed).is_err());
    }

    #[test]
    fn wrong_prefix_fails() {
        let alice = Keypair::generate(&mut OsRng);
        let bob = Keypair::generate(&mut OsRng);

        let (nonce, sealed) =
            seal(&mut OsRng, alice.secret(), &bob.public(), PREFIX, b"hello").unwrap();
        assert!(open(bob.secret(), &alice.public(), b"weft-xx ", &nonce, &sealed).is_err());
    }
}
