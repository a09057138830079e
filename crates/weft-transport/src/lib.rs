//! # WEFT Transport
//!
//! The unreliable datagram substrate underneath the WEFT protocol core.
//!
//! The core never touches sockets directly; it talks to a [`Substrate`]:
//! send a datagram, receive a datagram, nothing more. Two implementations
//! live here:
//!
//! - [`udp::UdpSubstrate`]: a real UDP socket (socket2 setup, tokio I/O)
//! - [`sim::SimNetwork`]: an in-memory network with programmable loss,
//!   used by the test suites

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod sim;
pub mod substrate;
pub mod udp;

pub use substrate::{Substrate, SubstrateError, SubstrateResult};
pub use udp::UdpSubstrate;

/// Largest datagram the protocol will ever ask a substrate to carry.
pub const MAX_DATAGRAM_SIZE: usize = 1500;
