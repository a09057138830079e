//! CurveCP-style key exchange.
//!
//! Three messages establish a channel: Hello (initiator proves possession
//! of a fresh short-term key), Cookie (responder hands back its own
//! short-term key sealed inside a stateless minute-key cookie), and
//! Initiate (initiator echoes the cookie and vouches for its long-term
//! identity). The responder allocates no per-connection state until a
//! valid Initiate arrives. A fourth packet type, Probe, exists only to
//! nudge outstanding initiators into retransmitting their hello during
//! hole punching.

pub mod initiator;
pub mod responder;
pub mod wire;

pub use initiator::{InitiatorState, KexInitiator};
pub use responder::{InitiateOutcome, KexResponder};
