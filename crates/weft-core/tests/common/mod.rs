//! Two hosts on a simulated network, driven deterministically with
//! explicit time.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand_core::OsRng;
use tokio::sync::mpsc::UnboundedReceiver;

use weft_core::host::{Host, HostEvent};
use weft_core::peer::PeerIdentity;
use weft_crypto::x25519::{Keypair, PublicKey};
use weft_transport::sim::SimNetwork;

pub struct TestNet {
    pub a: Host,
    pub b: Host,
    pub a_events: UnboundedReceiver<HostEvent>,
    pub b_events: UnboundedReceiver<HostEvent>,
    pub a_ep: SocketAddr,
    pub b_ep: SocketAddr,
    pub a_pk: PublicKey,
    pub b_pk: PublicKey,
    pub now: Instant,
}

impl TestNet {
    pub fn new() -> Self {
        let net = SimNetwork::new();
        let a_ep: SocketAddr = "10.0.0.1:3000".parse().unwrap();
        let b_ep: SocketAddr = "10.0.0.2:3000".parse().unwrap();
        let a_id = Keypair::generate(&mut OsRng);
        let b_id = Keypair::generate(&mut OsRng);
        let a_pk = a_id.public();
        let b_pk = b_id.public();
        let now = Instant::now();

        let (a, a_events) = Host::new(a_id, Arc::new(net.host(a_ep)), now);
        let (b, b_events) = Host::new(b_id, Arc::new(net.host(b_ep)), now);

        Self {
            a,
            b,
            a_events,
            b_events,
            a_ep,
            b_ep,
            a_pk,
            b_pk,
            now,
        }
    }

    /// Deliver queued datagrams in both directions until quiescent.
    pub fn pump(&mut self) {
        for _ in 0..100_000 {
            let from_a = self.a.outgoing();
            let from_b = self.b.outgoing();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for (bytes, dest) in from_a {
                if dest == self.b_ep {
                    self.b.handle_datagram(&bytes, self.a_ep, self.now);
                }
            }
            for (bytes, dest) in from_b {
                if dest == self.a_ep {
                    self.a.handle_datagram(&bytes, self.b_ep, self.now);
                }
            }
        }
    }

    /// Advance time, fire timers, and pump.
    pub fn advance(&mut self, step: Duration) {
        self.now += step;
        self.a.poll_timers(self.now);
        self.b.poll_timers(self.now);
        self.pump();
    }

    /// Connect a to b and run the handshake to completion. Returns
    /// (a's handle for b, b's handle for a).
    pub fn connect(&mut self) -> (PeerIdentity, PeerIdentity) {
        let b_handle = self.a.connect(self.b_pk, self.b_ep, self.now);
        self.pump();
        (b_handle, PeerIdentity::from_public_key(&self.a_pk))
    }

    /// Drain all pending events from one receiver.
    pub fn drain(rx: &mut UnboundedReceiver<HostEvent>) -> Vec<HostEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }
}

/// Whether a raw datagram is a kex hello.
pub fn is_hello(bytes: &[u8]) -> bool {
    weft_core::kex::wire::kex_magic(bytes) == Some(weft_core::kex::wire::HELLO_MAGIC)
}

/// Whether a raw datagram is a kex initiate.
pub fn is_initiate(bytes: &[u8]) -> bool {
    weft_core::kex::wire::kex_magic(bytes) == Some(weft_core::kex::wire::INITIATE_MAGIC)
}

/// Whether a raw datagram is an encrypted channel packet.
pub fn is_channel_packet(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes[0] != 0
}
