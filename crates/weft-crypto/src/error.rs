//! Error types for WEFT cryptographic operations.

use thiserror::Error;

/// Cryptographic errors.
///
/// Authentication failures deliberately carry no detail about what failed;
/// callers drop the offending packet silently (the sender may be an
/// attacker).
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD authentication failed on decryption.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Key material had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },

    /// The peer's public key is a low-order point.
    #[error("low-order public key rejected")]
    LowOrderPoint,

    /// A sealed box was shorter than its authentication tag.
    #[error("sealed box too short")]
    BoxTooShort,
}
