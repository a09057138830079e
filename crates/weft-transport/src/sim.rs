//! In-memory simulated network.
//!
//! Deterministic substrate for the test suites: datagrams between
//! registered endpoints are delivered through channels, with per-link
//! drop schedules, a capture tap, and raw injection for replay tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::substrate::{Substrate, SubstrateError, SubstrateResult};

type Datagram = (Vec<u8>, SocketAddr);
type Link = (SocketAddr, SocketAddr);

#[derive(Default)]
struct SimInner {
    endpoints: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    /// Remaining number of datagrams to drop, per (from, to) link.
    drop_plan: HashMap<Link, usize>,
    /// Copy of every datagram on a link, for tests that capture traffic.
    taps: HashMap<Link, mpsc::UnboundedSender<Vec<u8>>>,
    delivered: u64,
    dropped: u64,
}

/// A simulated network connecting any number of [`SimSubstrate`] endpoints.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Mutex<SimInner>>,
}

impl SimNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is already registered; tests pick distinct
    /// addresses.
    #[must_use]
    pub fn host(&self, addr: SocketAddr) -> SimSubstrate {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.endpoints.insert(addr, tx).is_none(),
            "duplicate sim endpoint {addr}"
        );
        SimSubstrate {
            addr,
            rx: tokio::sync::Mutex::new(rx),
            net: self.clone(),
        }
    }

    /// Drop the next `count` datagrams sent from `from` to `to`.
    pub fn drop_next(&self, from: SocketAddr, to: SocketAddr, count: usize) {
        self.inner
            .lock()
            .unwrap()
            .drop_plan
            .insert((from, to), count);
    }

    /// Copy every datagram sent from `from` to `to` into the returned
    /// receiver (delivery is unaffected).
    pub fn tap(&self, from: SocketAddr, to: SocketAddr) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().taps.insert((from, to), tx);
        rx
    }

    /// Inject a raw datagram to `to`, appearing to come from `from`.
    /// Used to replay captured packets.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        if let Some(dest) = inner.endpoints.get(&to) {
            let _ = dest.send((bytes, from));
        }
    }

    /// Total datagrams delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.lock().unwrap().delivered
    }

    /// Total datagrams dropped by drop schedules so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    fn route(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(tap) = inner.taps.get(&(from, to)) {
            let _ = tap.send(bytes.to_vec());
        }

        if let Some(remaining) = inner.drop_plan.get_mut(&(from, to)) {
            if *remaining > 0 {
                *remaining -= 1;
                inner.dropped += 1;
                tracing::debug!("sim: dropped datagram {from} -> {to}");
                return;
            }
        }

        if let Some(dest) = inner.endpoints.get(&to) {
            let _ = dest.send((bytes.to_vec(), from));
            inner.delivered += 1;
        } else {
            tracing::debug!("sim: no endpoint at {to}, datagram lost");
        }
    }
}

/// One endpoint on a [`SimNetwork`].
pub struct SimSubstrate {
    addr: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    net: SimNetwork,
}

#[async_trait]
impl Substrate for SimSubstrate {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> SubstrateResult<()> {
        self.net.route(self.addr, addr, buf);
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> SubstrateResult<(usize, SocketAddr)> {
        let (bytes, from) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(SubstrateError::Closed)?;
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> SubstrateResult<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn delivers_between_endpoints() {
        let net = SimNetwork::new();
        let a = net.host(ep(1));
        let b = net.host(ep(2));

        a.send_to(b"hello", ep(2)).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, ep(1));
    }

    #[tokio::test]
    async fn drop_schedule_consumes() {
        let net = SimNetwork::new();
        let a = net.host(ep(1));
        let b = net.host(ep(2));

        net.drop_next(ep(1), ep(2), 2);
        for _ in 0..3 {
            a.send_to(b"x", ep(2)).await.unwrap();
        }

        let mut buf = [0u8; 16];
        let (len, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 1);
        assert_eq!(net.dropped(), 2);
        assert_eq!(net.delivered(), 1);
    }
}
