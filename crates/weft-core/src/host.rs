//! The host context.
//!
//! One `Host` per process endpoint: it owns the bound substrate, the peer
//! table, the socket demultiplexer (channel bindings keyed by remote
//! endpoint and channel number), the key exchange responder, and every
//! outstanding key exchange initiator. All protocol processing is
//! synchronous and driven either by [`Host::run`] (live traffic) or by
//! calling [`Host::handle_datagram`]/[`Host::poll_timers`] directly with
//! explicit time (tests).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use weft_crypto::kdf::SessionKeySet;
use weft_crypto::x25519::{Keypair, PublicKey};
use weft_transport::{Substrate, UdpSubstrate, MAX_DATAGRAM_SIZE};

use crate::armor::SecretboxArmor;
use crate::channel::Channel;
use crate::congestion::RenoStrategy;
use crate::error::{HostError, StreamError};
use crate::kex::wire::{
    self, CookiePacket, HelloPacket, InitiatePacket, COOKIE_MAGIC, HELLO_MAGIC, INITIATE_MAGIC,
    PROBE_MAGIC,
};
use crate::kex::{KexInitiator, KexResponder};
use crate::mux::ChannelMux;
use crate::peer::{PeerIdentity, ShutdownMode, StreamPeer};
use crate::settings::HostSettings;
use crate::stream::{StreamEvent, StreamKey};

/// Events delivered to the application.
#[derive(Debug)]
pub enum HostEvent {
    /// A key exchange we initiated finished.
    KexCompleted {
        /// The peer the exchange was toward.
        peer: PeerIdentity,
        /// Whether a channel came up.
        success: bool,
    },
    /// A channel to a peer is up (either side may initiate).
    ChannelConnected {
        /// The connected peer.
        peer: PeerIdentity,
    },
    /// A stream-layer event.
    Stream {
        /// The peer the stream belongs to.
        peer: PeerIdentity,
        /// The event itself.
        event: StreamEvent,
    },
}

/// The process-wide protocol coordinator for one bound endpoint.
pub struct Host {
    identity: Keypair,
    substrate: Arc<dyn Substrate>,
    peers: HashMap<PeerIdentity, StreamPeer>,
    bindings: HashMap<(SocketAddr, u8), PeerIdentity>,
    initiators: HashMap<SocketAddr, (KexInitiator, PeerIdentity)>,
    responder: KexResponder,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    outbox: Vec<(Vec<u8>, SocketAddr)>,
    settings: Option<(HostSettings, PathBuf)>,
}

impl Host {
    /// Create a host over an already bound substrate.
    pub fn new(
        identity: Keypair,
        substrate: Arc<dyn Substrate>,
        now: Instant,
    ) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                identity,
                substrate,
                peers: HashMap::new(),
                bindings: HashMap::new(),
                initiators: HashMap::new(),
                responder: KexResponder::new(now),
                events_tx,
                outbox: Vec::new(),
                settings: None,
            },
            events_rx,
        )
    }

    /// Create a host bound to UDP, restoring identity and preferred port
    /// from the settings file (creating both as needed). Must be called
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Settings or bind failures.
    pub fn bind_udp(
        settings_path: PathBuf,
        bind_addr: SocketAddr,
        default_port: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HostEvent>), HostError> {
        let mut settings = HostSettings::load(&settings_path)?;
        let identity = settings.identity()?;
        let substrate =
            UdpSubstrate::bind_with_preference(bind_addr, settings.port, default_port)?;
        let local = substrate.local_addr()?;
        info!(%local, "host bound");
        settings.port = Some(local.port());
        settings.store(&settings_path)?;

        let (mut host, events) = Self::new(identity, Arc::new(substrate), Instant::now());
        host.settings = Some((settings, settings_path));
        Ok((host, events))
    }

    /// This host's long-term public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.identity.public()
    }

    /// Persisted settings, when the host was built from a settings file.
    #[must_use]
    pub fn settings(&self) -> Option<&HostSettings> {
        self.settings.as_ref().map(|(s, _)| s)
    }

    /// The bound local endpoint.
    ///
    /// # Errors
    ///
    /// Substrate failure.
    pub fn local_addr(&self) -> Result<SocketAddr, HostError> {
        Ok(self.substrate.local_addr()?)
    }

    /// Borrow a peer.
    #[must_use]
    pub fn peer(&self, id: PeerIdentity) -> Option<&StreamPeer> {
        self.peers.get(&id)
    }

    /// Borrow a peer mutably.
    pub fn peer_mut(&mut self, id: PeerIdentity) -> Option<&mut StreamPeer> {
        self.peers.get_mut(&id)
    }

    /// The channel binding for `(endpoint, channel)`, if any.
    #[must_use]
    pub fn channel_for(&self, ep: SocketAddr, chan: u8) -> Option<PeerIdentity> {
        self.bindings.get(&(ep, chan)).copied()
    }

    /// Register a peer reachable at `ep` holding `remote_pk`, and begin
    /// key exchange if no channel exists yet.
    pub fn connect(&mut self, remote_pk: PublicKey, ep: SocketAddr, now: Instant) -> PeerIdentity {
        let id = PeerIdentity::from_public_key(&remote_pk);
        let peer = self
            .peers
            .entry(id)
            .or_insert_with(|| StreamPeer::new(id));
        peer.remote_long_pk = Some(remote_pk);
        peer.remote_ep = Some(ep);
        let needs_kex = peer.primary.is_none() && !peer.kex_in_progress;
        if needs_kex {
            self.start_kex(id, now);
        }
        id
    }

    /// Open a top-level stream toward a connected (or connecting) peer.
    ///
    /// # Errors
    ///
    /// [`HostError::UnknownPeer`] before `connect`.
    pub fn open_stream(&mut self, id: PeerIdentity) -> Result<StreamKey, HostError> {
        let peer = self.peers.get_mut(&id).ok_or(HostError::UnknownPeer)?;
        Ok(peer.open_stream())
    }

    /// Open a substream under `parent`.
    ///
    /// # Errors
    ///
    /// Unknown peer or parent.
    pub fn open_substream(
        &mut self,
        id: PeerIdentity,
        parent: StreamKey,
    ) -> Result<StreamKey, HostError> {
        let peer = self.peers.get_mut(&id).ok_or(HostError::UnknownPeer)?;
        peer.open_substream(parent)
            .map_err(|_| HostError::UnknownPeer)
    }

    /// Accept the next substream a peer initiated under `parent`.
    pub fn accept_substream(&mut self, id: PeerIdentity, parent: StreamKey) -> Option<StreamKey> {
        self.peers.get_mut(&id)?.accept_substream(parent)
    }

    /// Write reliable bytes to a stream.
    ///
    /// # Errors
    ///
    /// Stream-layer errors surface synchronously.
    pub fn write(
        &mut self,
        id: PeerIdentity,
        key: StreamKey,
        data: &[u8],
        endflags: u8,
        now: Instant,
    ) -> Result<usize, StreamError> {
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream)?;
        let written = peer.write(key, data, endflags, now)?;
        self.after_peer_op(id, now);
        Ok(written)
    }

    /// Write one datagram to a stream.
    ///
    /// # Errors
    ///
    /// Stream-layer errors surface synchronously.
    pub fn write_datagram(
        &mut self,
        id: PeerIdentity,
        key: StreamKey,
        data: &[u8],
        now: Instant,
    ) -> Result<(), StreamError> {
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream)?;
        peer.write_datagram(key, data, now)?;
        self.after_peer_op(id, now);
        Ok(())
    }

    /// Read up to `max` in-order bytes from a stream.
    ///
    /// # Errors
    ///
    /// Stream-layer errors surface synchronously.
    pub fn read(
        &mut self,
        id: PeerIdentity,
        key: StreamKey,
        max: usize,
    ) -> Result<Vec<u8>, StreamError> {
        self.peers
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream)?
            .read(key, max)
    }

    /// Read one datagram from a stream.
    ///
    /// # Errors
    ///
    /// Stream-layer errors surface synchronously.
    pub fn read_datagram(
        &mut self,
        id: PeerIdentity,
        key: StreamKey,
    ) -> Result<Option<Vec<u8>>, StreamError> {
        self.peers
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream)?
            .read_datagram(key)
    }

    /// Shut down a stream.
    ///
    /// # Errors
    ///
    /// Stream-layer errors surface synchronously.
    pub fn shutdown(
        &mut self,
        id: PeerIdentity,
        key: StreamKey,
        mode: ShutdownMode,
        now: Instant,
    ) -> Result<(), StreamError> {
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or(StreamError::UnknownStream)?;
        peer.shutdown(key, mode, now)?;
        self.after_peer_op(id, now);
        Ok(())
    }

    /// Set a stream's scheduling priority.
    pub fn set_priority(&mut self, id: PeerIdentity, key: StreamKey, priority: i32) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.set_priority(key, priority);
        }
    }

    /// Send a hole-punch probe, unless a key exchange toward that
    /// endpoint is already in progress (probe loops otherwise).
    pub fn send_probe(&mut self, ep: SocketAddr) {
        if self.initiators.contains_key(&ep) {
            debug!(%ep, "probe suppressed, exchange in progress");
            return;
        }
        self.outbox.push((wire::encode_probe(), ep));
    }

    /// Cancel an outstanding key exchange toward `ep`. Before the first
    /// hello went out the cancel is silent; afterwards it completes the
    /// exchange as failed.
    pub fn cancel_exchange(&mut self, ep: SocketAddr) {
        if let Some((mut initiator, id)) = self.initiators.remove(&ep) {
            let silent = initiator.cancel();
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.kex_in_progress = false;
            }
            if !silent {
                let _ = self.events_tx.send(HostEvent::KexCompleted {
                    peer: id,
                    success: false,
                });
            }
        }
    }

    fn after_peer_op(&mut self, id: PeerIdentity, now: Instant) {
        let needs = self
            .peers
            .get(&id)
            .is_some_and(StreamPeer::needs_channel);
        if needs {
            self.start_kex(id, now);
        }
        self.drain_peer(id);
    }

    fn start_kex(&mut self, id: PeerIdentity, now: Instant) {
        let Some(peer) = self.peers.get(&id) else { return };
        let (Some(ep), Some(remote_pk)) = (peer.remote_ep, peer.remote_long_pk) else {
            warn!(peer = %id, "cannot start key exchange without endpoint and key");
            return;
        };
        if self.initiators.contains_key(&ep) {
            return;
        }
        // The channel number for the exchange: first free slot on this
        // socket for this endpoint.
        let Some(chan) = (1..=255u8).find(|n| !self.bindings.contains_key(&(ep, *n))) else {
            warn!(%ep, "channel number space exhausted");
            return;
        };

        let mut initiator = KexInitiator::new(self.identity.clone(), remote_pk, ep, chan, now);
        match initiator.exchange_keys(now) {
            Ok(hello) => {
                info!(peer = %id, %ep, chan, "starting key exchange");
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.kex_in_progress = true;
                }
                self.outbox.push((hello, ep));
                self.initiators.insert(ep, (initiator, id));
            }
            Err(e) => warn!(?e, "failed to start key exchange"),
        }
    }

    /// Process one received datagram. Returns whether it was consumed.
    pub fn handle_datagram(&mut self, bytes: &[u8], src: SocketAddr, now: Instant) -> bool {
        if bytes.is_empty() {
            return false;
        }
        if let Some(magic) = wire::kex_magic(bytes) {
            match magic {
                HELLO_MAGIC => self.on_hello(bytes, src),
                COOKIE_MAGIC => self.on_cookie(bytes, src, now),
                INITIATE_MAGIC => self.on_initiate(bytes, src, now),
                PROBE_MAGIC => self.on_probe(src, now),
                _ => {
                    debug!(%src, "unknown kex magic dropped");
                    return false;
                }
            }
            return true;
        }

        let chan = bytes[0];
        let Some(&peer_id) = self.bindings.get(&(src, chan)) else {
            debug!(%src, chan, "no channel binding, datagram dropped");
            return false;
        };
        let authenticated = self
            .peers
            .get_mut(&peer_id)
            .is_some_and(|peer| peer.receive_packet(bytes, now));
        // First authenticated traffic on the channel confirms a pending
        // exchange toward this endpoint.
        if authenticated {
            if let Some((initiator, id)) = self.initiators.get_mut(&src) {
                initiator.channel_confirmed();
                if initiator.is_done() {
                    let id = *id;
                    self.initiators.remove(&src);
                    let _ = self.events_tx.send(HostEvent::KexCompleted {
                        peer: id,
                        success: true,
                    });
                }
            }
        }
        self.drain_peer(peer_id);
        true
    }

    fn on_hello(&mut self, bytes: &[u8], src: SocketAddr) {
        let Ok(pkt) = HelloPacket::decode(bytes) else {
            return;
        };
        match self.responder.got_hello(&pkt, &self.identity) {
            Ok(cookie) => self.outbox.push((cookie, src)),
            Err(e) => debug!(?e, %src, "hello rejected"),
        }
    }

    fn on_cookie(&mut self, bytes: &[u8], src: SocketAddr, now: Instant) {
        let Ok(pkt) = CookiePacket::decode(bytes) else {
            return;
        };
        let Some((initiator, peer_id)) = self.initiators.get_mut(&src) else {
            debug!(%src, "cookie with no outstanding exchange");
            return;
        };
        let peer_id = *peer_id;
        let chan = initiator.channel_number();
        match initiator.got_cookie(&pkt, now) {
            Ok(outcome) => {
                self.outbox.push((outcome.initiate, src));
                self.create_channel(peer_id, src, chan, &outcome.keys, true, now);
            }
            Err(e) => debug!(?e, %src, "cookie rejected"),
        }
    }

    fn on_initiate(&mut self, bytes: &[u8], src: SocketAddr, now: Instant) {
        let Ok(pkt) = InitiatePacket::decode(bytes) else {
            return;
        };
        match self.responder.got_initiate(&pkt, &self.identity) {
            Ok(outcome) => {
                let peer_id = PeerIdentity::from_public_key(&outcome.initiator_long_pk);
                if let Some(&bound) = self.bindings.get(&(src, outcome.channel_number)) {
                    if bound != peer_id {
                        warn!(%src, chan = outcome.channel_number, "channel bound to another peer");
                        return;
                    }
                }
                self.peers
                    .entry(peer_id)
                    .or_insert_with(|| StreamPeer::new(peer_id))
                    .remote_long_pk = Some(outcome.initiator_long_pk);

                self.create_channel(peer_id, src, outcome.channel_number, &outcome.keys, false, now);

                // Confirm the exchange: a bare ack proves the channel is
                // live so the initiator can finish.
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.send_bare_ack(now);
                }
                self.drain_peer(peer_id);
            }
            Err(e) => debug!(?e, %src, "initiate rejected"),
        }
    }

    fn on_probe(&mut self, src: SocketAddr, now: Instant) {
        if let Some((initiator, _)) = self.initiators.get_mut(&src) {
            if let Some(hello) = initiator.probed(now) {
                debug!(%src, "probe: retransmitting hello");
                self.outbox.push((hello, src));
            }
        }
    }

    fn create_channel(
        &mut self,
        peer_id: PeerIdentity,
        remote_ep: SocketAddr,
        chan: u8,
        keys: &SessionKeySet,
        initiator: bool,
        now: Instant,
    ) {
        info!(peer = %peer_id, %remote_ep, chan, initiator, "creating channel");
        let armor = SecretboxArmor::new(keys);
        let mut channel = Channel::new(
            chan,
            chan,
            Box::new(armor),
            Box::new(RenoStrategy::new()),
            now,
        );
        channel.start();

        let peer = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| StreamPeer::new(peer_id));
        // Replace any previous primary before the new root stream exists,
        // so the old channel's detach pass cannot touch it.
        peer.teardown_channel();
        peer.remote_ep = Some(remote_ep);
        let mux = ChannelMux::new(
            channel,
            remote_ep,
            chan,
            keys.tx.channel_id,
            keys.rx.channel_id,
            initiator,
            &mut peer.set,
        );
        peer.channel_started(mux, now);
        self.bindings.insert((remote_ep, chan), peer_id);
        self.drain_peer(peer_id);
    }

    /// Drive every timer: responder rotation, kex retransmission, channel
    /// retransmit/ack timers, link-down teardown and reconnection.
    pub fn poll_timers(&mut self, now: Instant) {
        self.responder.poll_timers(now);

        let endpoints: Vec<SocketAddr> = self.initiators.keys().copied().collect();
        for ep in endpoints {
            let Some((initiator, peer_id)) = self.initiators.get_mut(&ep) else {
                continue;
            };
            let peer_id = *peer_id;
            let poll = initiator.poll_timers(now);
            if let Some(bytes) = poll.send {
                self.outbox.push((bytes, ep));
            }
            if poll.failed {
                self.initiators.remove(&ep);
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.kex_in_progress = false;
                }
                let _ = self.events_tx.send(HostEvent::KexCompleted {
                    peer: peer_id,
                    success: false,
                });
            }
        }

        let ids: Vec<PeerIdentity> = self.peers.keys().copied().collect();
        for id in ids {
            let went_down = self
                .peers
                .get_mut(&id)
                .is_some_and(|p| p.poll_timers(now));
            if went_down {
                self.unbind_peer(id);
                // Streams with pending data drive an automatic reconnect.
                let needs = self
                    .peers
                    .get(&id)
                    .is_some_and(StreamPeer::needs_channel);
                if needs {
                    info!(peer = %id, "link down with pending streams, reconnecting");
                    self.start_kex(id, now);
                }
            }
            self.drain_peer(id);
        }
    }

    fn unbind_peer(&mut self, id: PeerIdentity) {
        self.bindings.retain(|_, pid| *pid != id);
    }

    /// Earliest deadline across all timers.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = Some(self.responder.next_deadline());
        for (initiator, _) in self.initiators.values() {
            deadline = min_opt(deadline, initiator.next_deadline());
        }
        for peer in self.peers.values() {
            deadline = min_opt(deadline, peer.next_deadline());
        }
        deadline
    }

    fn drain_peer(&mut self, id: PeerIdentity) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        let Some(ep) = peer.remote_ep else { return };
        for bytes in peer.outbox.drain(..) {
            self.outbox.push((bytes, ep));
        }
        for event in peer.events.drain(..) {
            let host_event = match event {
                StreamEvent::ChannelConnected => HostEvent::ChannelConnected { peer: id },
                other => HostEvent::Stream {
                    peer: id,
                    event: other,
                },
            };
            let _ = self.events_tx.send(host_event);
        }
    }

    /// Take the queued outgoing datagrams (tests drive delivery manually).
    pub fn outgoing(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut self.outbox)
    }

    /// Send everything queued through the substrate.
    ///
    /// # Errors
    ///
    /// Substrate failures.
    pub async fn flush(&mut self) -> Result<(), HostError> {
        for (bytes, ep) in std::mem::take(&mut self.outbox) {
            self.substrate.send_to(&bytes, ep).await?;
        }
        Ok(())
    }

    /// One event-loop turn: flush, then wait for a datagram or the next
    /// timer deadline.
    ///
    /// # Errors
    ///
    /// Substrate failures.
    pub async fn run_once(&mut self) -> Result<(), HostError> {
        self.flush().await?;

        let deadline = self
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        let substrate = Arc::clone(&self.substrate);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        tokio::select! {
            received = substrate.recv_from(&mut buf) => {
                let (len, src) = received?;
                self.handle_datagram(&buf[..len], src, Instant::now());
            }
            () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                self.poll_timers(Instant::now());
            }
        }

        self.flush().await
    }

    /// Run the event loop until the substrate fails.
    ///
    /// # Errors
    ///
    /// The first substrate failure.
    pub async fn run(&mut self) -> Result<(), HostError> {
        loop {
            self.run_once().await?;
        }
    }
}

fn min_opt(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}
