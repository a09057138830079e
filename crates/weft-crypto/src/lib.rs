//! # WEFT Crypto
//!
//! Cryptographic primitives for the WEFT (Woven Encrypted Flow Transport)
//! protocol.
//!
//! This crate provides:
//! - X25519 key agreement for long-term and short-term (session) keys
//! - `XChaCha20-Poly1305` AEAD with detached associated data
//! - Public-key sealed boxes in the CurveCP style (key exchange packets)
//! - Rotating minute keys for stateless responder cookies
//! - The session key schedule derived from a completed key exchange
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | X25519 |
//! | AEAD | XChaCha20-Poly1305 |
//! | KDF | BLAKE3 `derive_key` |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod boxes;
pub mod error;
pub mod kdf;
pub mod minute;
pub mod x25519;

pub use error::CryptoError;
pub use kdf::SessionKeySet;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size.
pub const AEAD_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// AEAD authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Wire size of a kex packet nonce (the low bytes of the full AEAD nonce).
pub const WIRE_NONCE_SIZE: usize = 16;
