//! Per-peer stream state.
//!
//! A `StreamPeer` owns every stream toward one remote identity plus the
//! peer's primary channel. Streams outlive channels: when a channel fails,
//! its unacknowledged frames return to their streams, the streams drop to
//! wait-channel state, and everything reattaches once the host brings up a
//! replacement channel.

use std::net::SocketAddr;

use std::time::Instant;

use tracing::{debug, warn};

use weft_crypto::x25519::PublicKey;

use crate::channel::{LinkStatus, CHANNEL_HEADER_SIZE};
use crate::error::StreamError;
use crate::frame::{Frame, FLAG_DATA_CLOSE};
use crate::mux::ChannelMux;
use crate::stream::usid::UniqueStreamId;
use crate::stream::{BaseStream, StreamEvent, StreamKey, StreamSet, StreamState};

/// Opaque peer identity: the peer's long-term public key, or an
/// endpoint-derived surrogate when no identity is known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(pub [u8; 32]);

impl PeerIdentity {
    /// Identity of a known public key.
    #[must_use]
    pub fn from_public_key(pk: &PublicKey) -> Self {
        Self(pk.to_bytes())
    }

    /// Surrogate identity for an endpoint with no known key.
    #[must_use]
    pub fn surrogate(ep: &SocketAddr) -> Self {
        let tag = blake3::derive_key("weft eid surrogate", ep.to_string().as_bytes());
        Self(tag)
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Shutdown modes for [`StreamPeer::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop reading; further received data is discarded.
    Read,
    /// Close the write side with a final close-flagged segment.
    Write,
    /// Both halves.
    Close,
    /// Abort: reset the stream at the peer.
    Reset,
}

/// All stream state toward one peer.
pub struct StreamPeer {
    /// Who this peer is.
    pub id: PeerIdentity,
    /// The peer's long-term key, once known.
    pub remote_long_pk: Option<PublicKey>,
    /// Last known endpoint.
    pub remote_ep: Option<SocketAddr>,
    /// The peer's streams.
    pub set: StreamSet,
    /// The primary channel, if one is up.
    pub primary: Option<ChannelMux>,
    /// Events for the host to drain.
    pub events: Vec<StreamEvent>,
    /// Wire packets for the host to send to `remote_ep`.
    pub outbox: Vec<Vec<u8>>,
    /// A key exchange toward this peer is outstanding.
    pub kex_in_progress: bool,

    wait_channel: Vec<StreamKey>,
}

impl StreamPeer {
    /// Create an empty peer.
    #[must_use]
    pub fn new(id: PeerIdentity) -> Self {
        Self {
            id,
            remote_long_pk: None,
            remote_ep: None,
            set: StreamSet::default(),
            primary: None,
            events: Vec::new(),
            outbox: Vec::new(),
            kex_in_progress: false,
            wait_channel: Vec::new(),
        }
    }

    /// Open a top-level application stream toward this peer.
    pub fn open_stream(&mut self) -> StreamKey {
        let stream = BaseStream::new(None, true, true);
        let key = self.set.insert(stream);
        debug!(peer = %self.id, key, "opened stream");
        key
    }

    /// Open a child stream under `parent`.
    ///
    /// # Errors
    ///
    /// [`StreamError::UnknownStream`] when the parent is gone.
    pub fn open_substream(&mut self, parent: StreamKey) -> Result<StreamKey, StreamError> {
        if self.set.get(parent).is_none() {
            return Err(StreamError::UnknownStream);
        }
        let stream = BaseStream::new(Some(parent), false, true);
        let key = self.set.insert(stream);
        Ok(key)
    }

    /// Accept the next peer-initiated substream of `parent`.
    pub fn accept_substream(&mut self, parent: StreamKey) -> Option<StreamKey> {
        let child = self.set.get_mut(parent)?.received_substreams.pop_front()?;
        if let Some(stream) = self.set.get_mut(child) {
            if stream.state == StreamState::Accepting {
                stream.state = StreamState::Connected;
            }
        }
        Some(child)
    }

    /// Queue reliable bytes on a stream and schedule it.
    ///
    /// # Errors
    ///
    /// Propagates [`StreamError`] from the stream state machine.
    pub fn write(
        &mut self,
        key: StreamKey,
        data: &[u8],
        endflags: u8,
        now: Instant,
    ) -> Result<usize, StreamError> {
        let stream = self.set.get_mut(key).ok_or(StreamError::UnknownStream)?;
        let written = stream.write_data(data, endflags)?;
        self.tx_enqueue(key, now);
        Ok(written)
    }

    /// Queue a datagram on a stream and schedule it.
    ///
    /// # Errors
    ///
    /// Propagates [`StreamError`] from the stream state machine.
    pub fn write_datagram(
        &mut self,
        key: StreamKey,
        data: &[u8],
        now: Instant,
    ) -> Result<(), StreamError> {
        let stream = self.set.get_mut(key).ok_or(StreamError::UnknownStream)?;
        stream.write_datagram(data)?;
        self.tx_enqueue(key, now);
        Ok(())
    }

    /// Read up to `max` in-order bytes.
    ///
    /// # Errors
    ///
    /// [`StreamError::UnknownStream`] when the stream is gone.
    pub fn read(&mut self, key: StreamKey, max: usize) -> Result<Vec<u8>, StreamError> {
        let stream = self.set.get_mut(key).ok_or(StreamError::UnknownStream)?;
        Ok(stream.read_data(max))
    }

    /// Read one datagram, if available.
    ///
    /// # Errors
    ///
    /// [`StreamError::UnknownStream`] when the stream is gone.
    pub fn read_datagram(&mut self, key: StreamKey) -> Result<Option<Vec<u8>>, StreamError> {
        let stream = self.set.get_mut(key).ok_or(StreamError::UnknownStream)?;
        Ok(stream.read_datagram())
    }

    /// Set a stream's scheduling priority.
    pub fn set_priority(&mut self, key: StreamKey, priority: i32) {
        if let Some(stream) = self.set.get_mut(key) {
            stream.priority = priority;
        }
    }

    /// Close one or both halves of a stream.
    ///
    /// # Errors
    ///
    /// [`StreamError::UnknownStream`] when the stream is gone.
    pub fn shutdown(
        &mut self,
        key: StreamKey,
        mode: ShutdownMode,
        now: Instant,
    ) -> Result<(), StreamError> {
        let stream = self.set.get_mut(key).ok_or(StreamError::UnknownStream)?;
        match mode {
            ShutdownMode::Read => {
                stream.end_read = true;
            }
            ShutdownMode::Write => {
                if !stream.end_write {
                    stream.write_data(&[], FLAG_DATA_CLOSE)?;
                    self.tx_enqueue(key, now);
                }
            }
            ShutdownMode::Close => {
                stream.end_read = true;
                if !stream.end_write {
                    stream.write_data(&[], FLAG_DATA_CLOSE)?;
                    self.tx_enqueue(key, now);
                }
            }
            ShutdownMode::Reset => {
                let sid = stream.current_tx().filter(|a| a.is_in_use()).map(|a| a.sid);
                stream.fail("reset locally");
                stream.clear_attachments();
                if let Some(sid) = sid {
                    let Self { primary, set, events, outbox, .. } = self;
                    if let Some(mux) = primary.as_mut() {
                        mux.mark_closed(sid);
                        mux.queue_control(key, Frame::Reset { sid, flags: 0 });
                        mux.pump(set, now, outbox, events);
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether this peer needs a channel brought up.
    #[must_use]
    pub fn needs_channel(&self) -> bool {
        self.primary.is_none()
            && !self.kex_in_progress
            && (!self.wait_channel.is_empty() || !self.set.is_empty())
    }

    /// Schedule a stream for transmission, attaching it first if needed.
    pub fn tx_enqueue(&mut self, key: StreamKey, now: Instant) {
        if self.primary.is_none() {
            if let Some(stream) = self.set.get_mut(key) {
                if stream.state == StreamState::Fresh {
                    stream.state = StreamState::WaitChannel;
                }
            }
            if !self.wait_channel.contains(&key) {
                self.wait_channel.push(key);
            }
            debug!(key, "stream waiting for channel");
            return;
        }

        let attached = self
            .set
            .get(key)
            .and_then(BaseStream::current_tx)
            .is_some_and(|a| a.is_in_use());
        if attached {
            let Self { primary, set, .. } = self;
            if let Some(mux) = primary.as_mut() {
                mux.enqueue_stream(set, key);
            }
        } else {
            self.attach_for_transmit(key);
        }

        let Self { primary, set, events, outbox, .. } = self;
        if let Some(mux) = primary.as_mut() {
            mux.pump(set, now, outbox, events);
        }
    }

    /// Attach a stream (and any unattached ancestors) for transmission on
    /// the primary channel.
    fn attach_for_transmit(&mut self, key: StreamKey) {
        // Resolve the chain of ancestors that must attach first so the
        // child can name its parent's USID.
        let mut chain = vec![key];
        loop {
            let Some(&top) = chain.last() else { break };
            let Some(root_key) = self.primary.as_ref().map(|m| m.root_key) else {
                return;
            };
            let Some(stream) = self.set.get(top) else { return };
            if !(stream.init_pending && stream.parent_usid.is_none()) {
                break;
            }
            let parent_key = stream.parent_key.or({
                if stream.top_level {
                    Some(root_key)
                } else {
                    None
                }
            });
            let Some(parent_key) = parent_key else {
                if let Some(s) = self.set.get_mut(top) {
                    s.fail("parent stream closed before child stream could be initiated");
                }
                return;
            };
            if self.set.get(parent_key).is_none() {
                if let Some(s) = self.set.get_mut(top) {
                    s.fail("parent stream closed before child stream could be initiated");
                }
                return;
            }
            let parent_usid = self.set.get(parent_key).and_then(|p| p.usid);
            if let Some(stream) = self.set.get_mut(top) {
                stream.parent_key = Some(parent_key);
                if let Some(usid) = parent_usid {
                    stream.parent_usid = Some(usid);
                }
            }
            if parent_usid.is_some() {
                break;
            }
            chain.push(parent_key);
        }

        while let Some(k) = chain.pop() {
            self.attach_one(k);
            // Propagate the freshly assigned parent USID down the chain.
            if let Some(&child) = chain.last() {
                let parent_usid = self
                    .set
                    .get(k)
                    .and_then(|p| p.usid);
                if let (Some(usid), Some(stream)) = (parent_usid, self.set.get_mut(child)) {
                    stream.parent_usid = Some(usid);
                }
            }
        }
    }

    /// Allocate an LSID and slot for one stream on the primary channel.
    fn attach_one(&mut self, key: StreamKey) {
        let Self {
            primary,
            set,
            events,
            ..
        } = self;
        let Some(mux) = primary.as_mut() else { return };
        let Some(stream) = set.get(key) else { return };
        if stream.state == StreamState::Disconnected {
            return;
        }
        if stream.current_tx().is_some_and(|a| a.is_in_use()) {
            mux.enqueue_stream(set, key);
            return;
        }

        let (sid, victim) = mux.allocate_transmit_sid();
        if let Some(victim_key) = victim {
            // The LSID range is saturated: the previous holder loses its
            // attachment and rejoins the wait list.
            if let Some(v) = set.get_mut(victim_key) {
                if let Some(att) = v.current_tx_mut() {
                    let old_sid = att.sid;
                    att.clear();
                    mux.queue_control(
                        victim_key,
                        Frame::Detach {
                            sid: old_sid,
                            slot: 0,
                        },
                    );
                }
                v.tx_current_attachment = None;
                v.state = StreamState::WaitChannel;
            }
            mux.dequeue_stream(set, victim_key);
        }

        let Some(stream) = set.get_mut(key) else { return };
        let slot = match stream.free_tx_slot() {
            Ok(slot) => slot,
            Err(_) => {
                warn!(key, "both attachment slots busy");
                stream.fail("attachment slots exhausted");
                events.push(StreamEvent::Reset { stream: key });
                return;
            }
        };
        stream.tx_attachments[slot].set_attaching(sid);
        stream.tx_current_attachment = Some(slot);
        if stream.state == StreamState::Fresh || stream.state == StreamState::WaitChannel {
            stream.state = StreamState::Attaching;
        }
        if stream.usid.is_none() {
            let usid = UniqueStreamId::new(u32::from(sid), mux.tx_channel_id);
            stream.usid = Some(usid);
            set.index_usid(usid, key);
        }
        mux.bind_transmit_sid(sid, key);
        mux.enqueue_stream(set, key);
        debug!(key, sid, "stream attached for transmit");
    }

    /// Adopt a freshly negotiated channel as primary and reattach waiting
    /// streams.
    pub fn channel_started(&mut self, mux: ChannelMux, now: Instant) {
        if self.primary.is_some() {
            self.teardown_channel();
        }
        debug!(peer = %self.id, chan = mux.channel_number, "channel started");
        self.primary = Some(mux);
        self.kex_in_progress = false;
        self.events.push(StreamEvent::ChannelConnected);

        let mut waiting = std::mem::take(&mut self.wait_channel);
        for key in self.set.keys() {
            let reattach = self.set.get(key).is_some_and(|s| {
                s.state == StreamState::WaitChannel
                    || (s.has_work() && s.current_tx().is_none())
            });
            if reattach && !waiting.contains(&key) {
                waiting.push(key);
            }
        }
        for key in waiting {
            self.tx_enqueue(key, now);
        }
    }

    /// Tear down the primary channel, returning unacknowledged frames to
    /// their streams.
    pub fn teardown_channel(&mut self) {
        let Some(mut mux) = self.primary.take() else { return };
        warn!(peer = %self.id, "tearing down primary channel");
        let root = mux.root_key;
        mux.detach_all(&mut self.set);
        self.set.remove(root);
        self.events
            .push(StreamEvent::LinkStatusChanged(LinkStatus::Down));
        for key in self.set.keys() {
            if self.set.get(key).is_some_and(|s| {
                s.state == StreamState::WaitChannel && s.has_work()
            }) && !self.wait_channel.contains(&key)
            {
                self.wait_channel.push(key);
            }
        }
    }

    /// Process one received channel packet. Returns whether the packet
    /// authenticated and was consumed.
    pub fn receive_packet(&mut self, bytes: &[u8], now: Instant) -> bool {
        let Self {
            primary,
            set,
            events,
            outbox,
            ..
        } = self;
        let Some(mux) = primary.as_mut() else {
            return false;
        };

        let Ok(res) = mux.channel.receive(bytes, now) else {
            return false;
        };
        for ev in res.events {
            mux.handle_channel_event(set, ev, events);
        }

        match Frame::decode(&res.payload[CHANNEL_HEADER_SIZE..]) {
            Ok(frame) => {
                let send_ack = frame.wants_ack();
                mux.route_frame(set, res.pktseq, frame, events);
                let acks = mux.channel.acknowledge(res.pktseq, send_ack, now);
                mux.send_acks(set, acks, now, outbox);
            }
            Err(e) => {
                warn!(?e, "malformed stream frame dropped");
                let acks = mux.channel.acknowledge(res.pktseq, false, now);
                mux.send_acks(set, acks, now, outbox);
            }
        }

        mux.pump(set, now, outbox, events);
        true
    }

    /// Drive channel timers; returns true when the link went down and the
    /// channel was torn down.
    pub fn poll_timers(&mut self, now: Instant) -> bool {
        let went_down = {
            let Self {
                primary,
                set,
                events,
                outbox,
                ..
            } = self;
            let Some(mux) = primary.as_mut() else {
                return false;
            };
            let poll = mux.channel.poll_timers(now);
            mux.send_acks(set, poll.acks, now, outbox);
            for ev in poll.events {
                mux.handle_channel_event(set, ev, events);
            }
            mux.pump(set, now, outbox, events);
            mux.channel.link_status() == LinkStatus::Down
        };
        if went_down {
            self.teardown_channel();
        }
        went_down
    }

    /// The earliest channel timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.primary.as_ref().and_then(|m| m.channel.next_deadline())
    }

    /// Transmit a bare acknowledgment on the primary channel. Used by the
    /// key exchange responder to confirm a fresh channel to the initiator.
    pub fn send_bare_ack(&mut self, now: Instant) {
        let Self {
            primary,
            set,
            outbox,
            ..
        } = self;
        if let Some(mux) = primary.as_mut() {
            let (ackseq, ack_count) = mux.channel.rx_ack_state();
            mux.send_acks(
                set,
                vec![crate::channel::AckSend { ackseq, ack_count }],
                now,
                outbox,
            );
        }
    }
}
