//! Rotating minute keys for stateless responder cookies.
//!
//! The responder seals `(initiator short-term pk ∥ responder short-term sk)`
//! into a cookie under a symmetric key held only by itself, so it keeps no
//! per-connection state until a valid Initiate arrives. The key rotates
//! periodically; the previous key is retained for exactly one rotation so
//! cookies in flight still open.

use rand_core::{CryptoRng, RngCore};

use crate::aead::{AeadKey, Nonce};
use crate::CryptoError;

/// Nonce domain prefix for minute-key cookies.
pub const MINUTE_NONCE_PREFIX: &[u8; 8] = b"weft-mk ";

/// Wire size of a cookie nonce.
pub const COOKIE_NONCE_SIZE: usize = 16;

/// Current and previous minute keys.
pub struct MinuteKeys {
    current: AeadKey,
    previous: Option<AeadKey>,
}

impl MinuteKeys {
    /// Start with a fresh random key and no predecessor.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            current: AeadKey::generate(rng),
            previous: None,
        }
    }

    /// Rotate: the current key becomes the previous one, the old previous
    /// key is destroyed.
    pub fn rotate<R: RngCore + CryptoRng>(&mut self, rng: &mut R) {
        let fresh = AeadKey::generate(rng);
        self.previous = Some(std::mem::replace(&mut self.current, fresh));
    }

    /// Seal a cookie under the current minute key. Returns
    /// `(wire_nonce, sealed)`.
    ///
    /// # Errors
    ///
    /// Propagates AEAD encryption failure.
    pub fn seal<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
    ) -> Result<([u8; COOKIE_NONCE_SIZE], Vec<u8>), CryptoError> {
        let mut wire = [0u8; COOKIE_NONCE_SIZE];
        rng.fill_bytes(&mut wire);
        let sealed = self.current.encrypt(&cookie_nonce(&wire), plaintext, &[])?;
        Ok((wire, sealed))
    }

    /// Open a cookie, trying the current key and then the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthenticationFailed`] if neither key opens it.
    pub fn open(
        &self,
        wire_nonce: &[u8; COOKIE_NONCE_SIZE],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = cookie_nonce(wire_nonce);
        self.current
            .decrypt(&nonce, sealed, &[])
            .or_else(|_| match &self.previous {
                Some(prev) => prev.decrypt(&nonce, sealed, &[]),
                None => Err(CryptoError::AuthenticationFailed),
            })
    }
}

fn cookie_nonce(wire: &[u8; COOKIE_NONCE_SIZE]) -> Nonce {
    Nonce::with_prefix(MINUTE_NONCE_PREFIX, wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn cookie_survives_one_rotation() {
        let mut keys = MinuteKeys::generate(&mut OsRng);
        let (nonce, sealed) = keys.seal(&mut OsRng, b"cookie state").unwrap();

        keys.rotate(&mut OsRng);
        assert_eq!(keys.open(&nonce, &sealed).unwrap(), b"cookie state");

        keys.rotate(&mut OsRng);
        assert!(keys.open(&nonce, &sealed).is_err());
    }

    #[test]
    fn foreign_cookie_rejected() {
        let keys = MinuteKeys::generate(&mut OsRng);
        let other = MinuteKeys::generate(&mut OsRng);
        let (nonce, sealed) = other.seal(&mut OsRng, b"cookie state").unwrap();
        assert!(keys.open(&nonce, &sealed).is_err());
    }
}
