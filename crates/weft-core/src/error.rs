//! Error types for the WEFT protocol core.

use thiserror::Error;

/// Core protocol errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Frame parsing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Channel error.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Key exchange error.
    #[error("key exchange error: {0}")]
    Kex(#[from] KexError),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Host error.
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(#[from] weft_crypto::CryptoError),
}

/// Stream frame parsing errors. A malformed frame from a peer is a
/// protocol violation: the packet is dropped and, where a stream can be
/// identified, escalated to a Reset.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame too short to parse.
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Invalid frame type nibble.
    #[error("invalid frame type: 0x{0:X}")]
    InvalidType(u8),

    /// The attach payload's tagged-value encoding did not parse.
    #[error("malformed attach payload")]
    MalformedAttach,
}

/// Channel-level errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is not active.
    #[error("channel inactive")]
    Inactive,

    /// The 64-bit sequence space is nearly exhausted; no rekey protocol
    /// exists, so the channel must be torn down.
    #[error("packet sequence space exhausted")]
    SequenceExhausted,

    /// Packet rejected (runt, replay, authentication failure, or
    /// out-of-range acknowledgment). Dropped silently on the wire.
    #[error("packet dropped")]
    PacketDropped,

    /// Armor failed while encoding an outbound packet.
    #[error(transparent)]
    Crypto(#[from] weft_crypto::CryptoError),
}

/// Key exchange errors. Responder-side failures are never reported to the
/// peer; these surface only in local diagnostics.
#[derive(Debug, Error)]
pub enum KexError {
    /// Packet did not match any expected layout.
    #[error("malformed key exchange packet")]
    Malformed,

    /// Cookie did not validate or did not match the initiator key.
    #[error("cookie rejected")]
    CookieRejected,

    /// The vouch subpacket did not validate.
    #[error("vouch rejected")]
    VouchRejected,

    /// A replayed initiate was detected.
    #[error("initiate replayed")]
    Replay,

    /// The exchange is in the wrong state for this input.
    #[error("unexpected packet for key exchange state")]
    WrongState,

    /// The retransmit budget was exhausted.
    #[error("key exchange timed out")]
    TimedOut,

    /// Underlying crypto failure.
    #[error(transparent)]
    Crypto(#[from] weft_crypto::CryptoError),
}

/// Stream-level errors surfaced synchronously to the caller.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream does not exist (or no longer exists).
    #[error("unknown stream")]
    UnknownStream,

    /// Write on a stream whose write side is closed.
    #[error("write after close")]
    WriteAfterClose,

    /// The stream is disconnected.
    #[error("stream disconnected: {0}")]
    Disconnected(String),

    /// Both attachment slots are busy.
    #[error("all attachment slots in use")]
    SlotsExhausted,
}

/// Host-level errors.
#[derive(Debug, Error)]
pub enum HostError {
    /// A channel binding already exists for this endpoint and number.
    #[error("channel {1} already bound for {0}")]
    ChannelBound(std::net::SocketAddr, u8),

    /// No free channel number for this endpoint.
    #[error("channel number space exhausted for {0}")]
    ChannelNumbersExhausted(std::net::SocketAddr),

    /// Unknown peer.
    #[error("unknown peer")]
    UnknownPeer,

    /// Substrate failure.
    #[error(transparent)]
    Substrate(#[from] weft_transport::SubstrateError),

    /// Settings could not be loaded or stored.
    #[error("settings error: {0}")]
    Settings(String),
}
