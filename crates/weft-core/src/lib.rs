//! # WEFT Core
//!
//! Core protocol implementation for WEFT (Woven Encrypted Flow
//! Transport): a secure multi-stream transport over an unreliable
//! datagram substrate.
//!
//! This crate provides:
//! - The channel packet engine: 64-bit sequences behind a 24-bit wire
//!   field, AEAD framing, replay window, selective acknowledgment,
//!   retransmission timers, pluggable congestion control
//! - A CurveCP-style key exchange (hello / cookie / initiate) with a
//!   stateless responder and rotating minute keys
//! - The stream multiplexer: hierarchical streams with 16-bit per-channel
//!   LSIDs, globally unique USIDs, two-slot attachments, and priority
//!   scheduling
//! - The host context tying sockets, peers, timers, and exchanges together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                         Host                            │
//! │   (socket demux, peers, key exchanges, timers)          │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Stream multiplexer                   │
//! │   (LSID tables, priority scheduler, attach lifecycle)   │
//! ├─────────────────────────────────────────────────────────┤
//! │                        Channel                          │
//! │   (sequencing, replay window, acks, congestion, AEAD)   │
//! └─────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod armor;
pub mod channel;
pub mod congestion;
pub mod error;
pub mod frame;
pub mod host;
pub mod kex;
pub mod mux;
pub mod peer;
pub mod settings;
pub mod stream;

mod timer;

pub use armor::{ChannelArmor, SecretboxArmor};
pub use channel::{Channel, ChannelEvent, LinkStatus, PacketSeq};
pub use congestion::{CongestionStrategy, RenoStrategy, CWND_MAX, CWND_MIN};
pub use error::Error;
pub use frame::{Frame, FrameType};
pub use host::{Host, HostEvent};
pub use peer::{PeerIdentity, ShutdownMode, StreamPeer};
pub use stream::{StreamEvent, StreamKey, UniqueStreamId};

/// Channel header size in bytes (4 clear + 4 encrypted).
pub const CHANNEL_HEADER_SIZE: usize = channel::CHANNEL_HEADER_SIZE;

/// AEAD authentication tag size.
pub const AUTH_TAG_SIZE: usize = weft_crypto::TAG_SIZE;
