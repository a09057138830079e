//! The per-channel stream multiplexer.
//!
//! Owns the two LSID tables (transmit and receive namespaces are
//! independent), the priority-ordered sending list, and the table of
//! frames awaiting acknowledgment. Streams are referred to by key into the
//! peer's [`StreamSet`]; the multiplexer holds no stream pointers.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, warn};

use crate::channel::{AckSend, Channel, ChannelEvent, PacketSeq, CHANNEL_HEADER_SIZE};
use crate::frame::{
    decode_window, encode_window, Frame, FLAG_RESET_REMOTE,
};
use crate::stream::base::TxSegment;
use crate::stream::usid::UniqueStreamId;
use crate::stream::{BaseStream, StreamEvent, StreamKey, StreamSet, StreamState};

/// LSID of the root stream, pre-attached in both directions.
pub const ROOT_SID: u16 = 0;

/// In-use LSIDs to skip during allocation before forcibly detaching one.
const MAX_SID_SKIP: u16 = 16;

/// A transmitted frame awaiting acknowledgment on this channel.
#[derive(Debug, Clone)]
struct TxRecord {
    stream: StreamKey,
    frame: Frame,
    /// Already reported missed once.
    late: bool,
}

/// One channel plus its stream tables and scheduler.
pub struct ChannelMux {
    /// The packet engine underneath.
    pub channel: Channel,
    /// Where the peer's socket lives.
    pub remote_ep: SocketAddr,
    /// The negotiated channel number (both directions).
    pub channel_number: u8,
    /// Half-channel id of our transmit direction.
    pub tx_channel_id: [u8; 8],
    /// Half-channel id of our receive direction.
    pub rx_channel_id: [u8; 8],
    /// Key of the root stream in the peer's stream set.
    pub root_key: StreamKey,

    transmit_sids: HashMap<u16, StreamKey>,
    receive_sids: HashMap<u16, StreamKey>,
    transmit_sid_counter: u16,
    sending_streams: VecDeque<StreamKey>,
    control_queue: VecDeque<(StreamKey, Frame)>,
    waiting_ack: BTreeMap<PacketSeq, TxRecord>,
    closed_streams: HashSet<u16>,
    /// LSID (receive space) of the most recent data-bearing stream;
    /// window updates piggyback on it.
    ack_sid: u16,
}

impl ChannelMux {
    /// Build the multiplexer around a started channel and pre-attach the
    /// root stream (LSID 0) in both directions.
    pub fn new(
        channel: Channel,
        remote_ep: SocketAddr,
        channel_number: u8,
        tx_channel_id: [u8; 8],
        rx_channel_id: [u8; 8],
        initiator: bool,
        set: &mut StreamSet,
    ) -> Self {
        let mut root = BaseStream::new(None, false, false);
        root.state = StreamState::Listening;
        // Both sides derive the same root USID: the initiator tags it with
        // its transmit half-channel id, which is the responder's receive id.
        let half = if initiator { tx_channel_id } else { rx_channel_id };
        root.usid = Some(UniqueStreamId::new(0, half));
        root.tx_attachments[0].set_attaching(ROOT_SID);
        root.tx_attachments[0].set_active(true);
        root.tx_current_attachment = Some(0);
        root.rx_attachments[0].set_active(ROOT_SID, 1);
        let root_key = set.insert(root);

        let mut transmit_sids = HashMap::new();
        transmit_sids.insert(ROOT_SID, root_key);
        let mut receive_sids = HashMap::new();
        receive_sids.insert(ROOT_SID, root_key);

        Self {
            channel,
            remote_ep,
            channel_number,
            tx_channel_id,
            rx_channel_id,
            root_key,
            transmit_sids,
            receive_sids,
            transmit_sid_counter: 1,
            sending_streams: VecDeque::new(),
            control_queue: VecDeque::new(),
            waiting_ack: BTreeMap::new(),
            closed_streams: HashSet::new(),
            ack_sid: ROOT_SID,
        }
    }

    /// Number of frames awaiting acknowledgment (diagnostics).
    #[must_use]
    pub fn waiting_ack_len(&self) -> usize {
        self.waiting_ack.len()
    }

    /// Look up the stream bound to a transmit LSID.
    #[must_use]
    pub fn transmit_stream(&self, sid: u16) -> Option<StreamKey> {
        self.transmit_sids.get(&sid).copied()
    }

    /// Look up the stream bound to a receive LSID.
    #[must_use]
    pub fn receive_stream(&self, sid: u16) -> Option<StreamKey> {
        self.receive_sids.get(&sid).copied()
    }

    /// Allocate a transmit LSID: scan forward from the rolling counter,
    /// skipping up to [`MAX_SID_SKIP`] in-use LSIDs; when the whole range
    /// is busy, forcibly detach the stream holding the first candidate and
    /// reuse its LSID. Returns the LSID and the detached victim, if any.
    pub fn allocate_transmit_sid(&mut self) -> (u16, Option<StreamKey>) {
        let first = self.bump_sid_counter();
        let mut sid = first;
        let mut skipped = 0;
        while self.transmit_sids.contains_key(&sid) {
            skipped += 1;
            if skipped > MAX_SID_SKIP {
                let victim = self.transmit_sids.remove(&first);
                warn!(sid = first, "transmit LSID space exhausted, detaching holder");
                return (first, victim);
            }
            sid = self.bump_sid_counter();
        }
        (sid, None)
    }

    fn bump_sid_counter(&mut self) -> u16 {
        let sid = self.transmit_sid_counter;
        self.transmit_sid_counter = self.transmit_sid_counter.wrapping_add(1);
        if self.transmit_sid_counter == ROOT_SID {
            self.transmit_sid_counter = 1;
        }
        sid
    }

    /// Bind a transmit LSID to a stream.
    pub fn bind_transmit_sid(&mut self, sid: u16, key: StreamKey) {
        self.transmit_sids.insert(sid, key);
    }

    /// Insert a stream into the sending list, ordered by priority:
    /// after every stream with strictly greater priority and after its
    /// equals (stable within a priority level).
    pub fn enqueue_stream(&mut self, set: &mut StreamSet, key: StreamKey) {
        let Some(stream) = set.get_mut(key) else { return };
        if stream.tx_enqueued {
            return;
        }
        stream.tx_enqueued = true;
        let prio = stream.priority;

        let pos = self
            .sending_streams
            .iter()
            .position(|&k| set.get(k).map_or(true, |s| s.priority < prio))
            .unwrap_or(self.sending_streams.len());
        debug!(?key, prio, pos, "enqueue stream");
        self.sending_streams.insert(pos, key);
    }

    /// Remove a stream from the sending list.
    pub fn dequeue_stream(&mut self, set: &mut StreamSet, key: StreamKey) {
        self.sending_streams.retain(|&k| k != key);
        if let Some(stream) = set.get_mut(key) {
            stream.tx_enqueued = false;
        }
    }

    /// Queue a control frame (Reset/Detach) owned by `key`.
    pub fn queue_control(&mut self, key: StreamKey, frame: Frame) {
        self.control_queue.push_back((key, frame));
    }

    /// Record a locally initiated close: the LSID stays reserved until the
    /// Reset is acknowledged.
    pub fn mark_closed(&mut self, sid: u16) {
        self.closed_streams.insert(sid);
    }

    /// Drain the scheduler while the congestion window allows.
    pub fn pump(
        &mut self,
        set: &mut StreamSet,
        now: Instant,
        outbox: &mut Vec<Vec<u8>>,
        _events: &mut Vec<StreamEvent>,
    ) {
        // Control frames first; they are small and unblock peers.
        while self.channel.may_transmit() > 0 {
            let Some((key, frame)) = self.control_queue.pop_front() else {
                break;
            };
            self.transmit_frame(key, frame, now, outbox);
        }

        while self.channel.may_transmit() > 0 {
            let Some(key) = self.sending_streams.pop_front() else {
                break;
            };
            if let Some(stream) = set.get_mut(key) {
                stream.tx_enqueued = false;
            }
            self.transmit_on(set, key, now, outbox);
        }
    }

    /// Let one stream transmit one packet, re-enqueueing it if it still
    /// has work it can make progress on.
    fn transmit_on(
        &mut self,
        set: &mut StreamSet,
        key: StreamKey,
        now: Instant,
        outbox: &mut Vec<Vec<u8>>,
    ) {
        // Copy out what frame construction needs, releasing the borrow.
        let (slot, sid, acked, attaching) = {
            let Some(stream) = set.get(key) else { return };
            if stream.state == StreamState::Disconnected {
                return;
            }
            let Some(idx) = stream.tx_current_attachment else {
                return;
            };
            let att = &stream.tx_attachments[idx];
            (
                idx as u8,
                att.sid,
                att.is_acked(),
                !matches!(
                    att.state,
                    crate::stream::attach::TxAttachState::Active { .. }
                ),
            )
        };

        let frame = if acked {
            self.next_data_frame(set, key, sid)
        } else {
            self.next_binding_frame(set, key, sid, slot, attaching)
        };
        let Some(frame) = frame else { return };

        if matches!(frame, Frame::Init { .. } | Frame::Reply { .. } | Frame::Attach { .. }) {
            if let Some(stream) = set.get_mut(key) {
                if let Some(att) = stream.current_tx_mut() {
                    att.set_active(att.is_acked());
                }
            }
        }

        // A bare attach carries no data; the stream stalls until its ack.
        let sent_bare_attach = matches!(frame, Frame::Attach { .. });
        let sent_payload = matches!(
            frame,
            Frame::Init { ref payload, .. } | Frame::Reply { ref payload, .. }
                if !payload.is_empty()
        );

        self.transmit_frame(key, frame, now, outbox);

        // Re-enqueue while the stream can keep making progress.
        let can_continue = {
            let Some(stream) = set.get(key) else { return };
            if sent_bare_attach || !stream.has_work() {
                false
            } else if stream.current_tx().is_some_and(|a| a.is_acked()) {
                true
            } else {
                // Unacked binding: more Init/Reply segments can flow only
                // while offsets still fit their 16-bit sequence field.
                sent_payload
                    && stream
                        .tx_queue
                        .front()
                        .is_some_and(|seg| seg.reliable && seg.byte_seq <= 0xffff)
            }
        };
        if can_continue {
            self.enqueue_stream(set, key);
        }
    }

    /// Build the next Data/Datagram frame for a fully attached stream.
    fn next_data_frame(
        &mut self,
        set: &mut StreamSet,
        key: StreamKey,
        sid: u16,
    ) -> Option<Frame> {
        let stream = set.get_mut(key)?;

        // Flow control: reliable segments stay queued once they would
        // overrun the peer's advertised window past the oldest
        // unacknowledged byte. An Ack with a larger window releases them.
        if let Some(front) = stream.tx_queue.front() {
            if front.reliable {
                let floor = stream
                    .tx_waiting
                    .first()
                    .copied()
                    .unwrap_or(front.byte_seq);
                if front.byte_seq.wrapping_sub(floor) >= stream.tx_window {
                    debug!(sid, "transmit window full");
                    return None;
                }
            }
        }

        let seg = stream.tx_queue.pop_front()?;
        let window = encode_window(stream.receive_window);
        if seg.reliable {
            stream.tx_waiting.insert(seg.byte_seq);
            Some(Frame::Data {
                sid,
                byte_seq: seg.byte_seq,
                window,
                flags: seg.flags,
                payload: seg.payload,
            })
        } else {
            Some(Frame::Datagram {
                sid,
                window,
                flags: seg.flags,
                payload: seg.payload,
            })
        }
    }

    /// Build the frame that binds the LSID: Reply when the peer created
    /// the stream, Init when the parent is attached here and the byte
    /// sequence still fits, a bare Attach otherwise.
    fn next_binding_frame(
        &mut self,
        set: &mut StreamSet,
        key: StreamKey,
        sid: u16,
        slot: u8,
        _attaching: bool,
    ) -> Option<Frame> {
        let (has_rx, rx_sid, init_pending, parent_key, usid, parent_usid) = {
            let stream = set.get(key)?;
            let rx = stream
                .rx_attachments
                .iter()
                .find(|a| a.is_active())
                .map(|a| a.sid);
            (
                rx.is_some(),
                rx.unwrap_or(0),
                stream.init_pending,
                stream.parent_key,
                stream.usid,
                stream.parent_usid,
            )
        };

        // Parent's transmit LSID on this channel, for the Init header.
        let parent_sid = parent_key.and_then(|pk| {
            set.get(pk).and_then(|p| {
                p.current_tx()
                    .filter(|a| a.is_in_use() && self.transmit_sids.get(&a.sid) == Some(&pk))
                    .map(|a| a.sid)
            })
        });

        if has_rx {
            let stream = set.get_mut(key)?;
            if let Some(seg) = front_reliable_short(stream) {
                stream.tx_waiting.insert(seg.byte_seq);
                let window = encode_window(stream.receive_window);
                return Some(Frame::Reply {
                    remote_sid: rx_sid,
                    new_sid: sid,
                    byte_seq: seg.byte_seq as u16,
                    window,
                    flags: seg.flags,
                    payload: seg.payload,
                });
            }
            // The next offset no longer fits a Reply; attach explicitly.
        }

        if init_pending && !has_rx {
            if let Some(parent_sid) = parent_sid {
                let stream = set.get_mut(key)?;
                if let Some(seg) = front_reliable_short(stream) {
                    stream.tx_waiting.insert(seg.byte_seq);
                    let window = encode_window(stream.receive_window);
                    return Some(Frame::Init {
                        parent_sid,
                        new_sid: sid,
                        byte_seq: seg.byte_seq as u16,
                        window,
                        flags: seg.flags,
                        payload: seg.payload,
                    });
                }
                if stream.tx_byte_seq <= 0xffff {
                    // Announce the stream even with nothing queued yet.
                    let byte_seq = stream.tx_byte_seq as u16;
                    let window = encode_window(stream.receive_window);
                    return Some(Frame::Init {
                        parent_sid,
                        new_sid: sid,
                        byte_seq,
                        window,
                        flags: 0,
                        payload: Vec::new(),
                    });
                }
            }
        }

        // Fall back to an explicit attach; data waits for its ack.
        let usid = usid?;
        let window = encode_window(set.get(key)?.receive_window);
        Some(Frame::Attach {
            sid,
            slot,
            init: init_pending,
            window,
            usid,
            parent_usid: if init_pending { parent_usid } else { None },
        })
    }

    /// Encrypt and queue one frame, recording it for acknowledgment.
    fn transmit_frame(
        &mut self,
        key: StreamKey,
        frame: Frame,
        now: Instant,
        outbox: &mut Vec<Vec<u8>>,
    ) {
        let mut packet = vec![0u8; CHANNEL_HEADER_SIZE];
        frame.encode(&mut packet);
        match self.channel.transmit_data(packet, now) {
            Ok((pktseq, wire)) => {
                outbox.push(wire);
                self.waiting_ack.insert(
                    pktseq,
                    TxRecord {
                        stream: key,
                        frame,
                        late: false,
                    },
                );
            }
            Err(e) => warn!(?e, "transmit failed"),
        }
    }

    /// Emit acknowledgment packets, piggybacking the window byte of the
    /// stream data most recently arrived on (the root stream otherwise).
    pub fn send_acks(
        &mut self,
        set: &StreamSet,
        acks: Vec<AckSend>,
        now: Instant,
        outbox: &mut Vec<Vec<u8>>,
    ) {
        for ack in acks {
            let sid = if self.receive_sids.contains_key(&self.ack_sid) {
                self.ack_sid
            } else {
                ROOT_SID
            };
            let window = self
                .receive_sids
                .get(&sid)
                .and_then(|k| set.get(*k))
                .map_or(0, |s| encode_window(s.receive_window));

            let mut packet = vec![0u8; CHANNEL_HEADER_SIZE];
            Frame::Ack { sid, window }.encode(&mut packet);
            match self
                .channel
                .transmit_ack_packet(packet, ack.ackseq, ack.ack_count, now)
            {
                Ok((_, wire)) => outbox.push(wire),
                Err(e) => warn!(?e, "ack transmit failed"),
            }
        }
    }

    /// Apply one channel acknowledgment event.
    pub fn handle_channel_event(
        &mut self,
        set: &mut StreamSet,
        event: ChannelEvent,
        events: &mut Vec<StreamEvent>,
    ) {
        match event {
            ChannelEvent::Acknowledged { txseq, npackets, .. } => {
                for seq in txseq..txseq + u64::from(npackets) {
                    self.acknowledged(set, seq, events);
                }
            }
            ChannelEvent::Missed { txseq, npackets } => {
                for seq in txseq..txseq + u64::from(npackets) {
                    self.missed(set, seq);
                }
            }
            ChannelEvent::Expired { txseq, npackets } => {
                for seq in txseq..txseq + u64::from(npackets) {
                    self.expired(set, seq);
                }
            }
            ChannelEvent::ReadyTransmit => {
                // The caller pumps after event processing.
            }
            ChannelEvent::StatusChanged(status) => {
                events.push(StreamEvent::LinkStatusChanged(status));
            }
        }
    }

    fn acknowledged(&mut self, set: &mut StreamSet, txseq: PacketSeq, events: &mut Vec<StreamEvent>) {
        let Some(rec) = self.waiting_ack.remove(&txseq) else {
            return;
        };
        debug!(txseq, "frame acknowledged");
        let key = rec.stream;
        match rec.frame {
            Frame::Data { byte_seq, .. } => {
                if let Some(stream) = set.get_mut(key) {
                    stream.tx_waiting.remove(&byte_seq);
                }
            }
            Frame::Init { byte_seq, .. } | Frame::Reply { byte_seq, .. } => {
                if let Some(stream) = set.get_mut(key) {
                    stream.tx_waiting.remove(&u32::from(byte_seq));
                    self.binding_acked(stream, key, events);
                }
                if set.get(key).is_some_and(BaseStream::has_work) {
                    self.enqueue_stream(set, key);
                }
            }
            Frame::Attach { .. } => {
                if let Some(stream) = set.get_mut(key) {
                    self.binding_acked(stream, key, events);
                }
                if set.get(key).is_some_and(BaseStream::has_work) {
                    self.enqueue_stream(set, key);
                }
            }
            Frame::Reset { sid, .. } => {
                self.closed_streams.remove(&sid);
                self.transmit_sids.remove(&sid);
            }
            Frame::Datagram { .. } | Frame::Ack { .. } | Frame::Detach { .. } => {}
        }
    }

    fn binding_acked(
        &mut self,
        stream: &mut BaseStream,
        key: StreamKey,
        events: &mut Vec<StreamEvent>,
    ) {
        if let Some(att) = stream.current_tx_mut() {
            if !att.is_acked() {
                att.set_active(true);
                if stream.state == StreamState::Attaching {
                    stream.state = StreamState::Connected;
                }
                stream.init_pending = false;
                events.push(StreamEvent::Attached { stream: key });
            }
        }
    }

    fn missed(&mut self, set: &mut StreamSet, txseq: PacketSeq) {
        match self.waiting_ack.get_mut(&txseq) {
            None => {
                warn!(txseq, "missed packet has no record");
                return;
            }
            Some(rec) if rec.late => return,
            Some(rec) => rec.late = true,
        }
        let Some(rec) = self.waiting_ack.remove(&txseq) else {
            return;
        };
        debug!(txseq, "frame missed, returning to stream");
        self.return_frame(set, rec);
    }

    fn expired(&mut self, set: &mut StreamSet, txseq: PacketSeq) {
        let Some(rec) = self.waiting_ack.remove(&txseq) else {
            return;
        };
        debug!(txseq, "frame expired");
        self.return_frame(set, rec);
    }

    /// Hand an unacknowledged frame back to its stream for retransmission
    /// (reliable frames) or disposal (datagrams, detaches).
    fn return_frame(&mut self, set: &mut StreamSet, rec: TxRecord) {
        let key = rec.stream;
        match rec.frame {
            Frame::Data {
                byte_seq,
                flags,
                payload,
                ..
            } => {
                if let Some(stream) = set.get_mut(key) {
                    if stream.state != StreamState::Disconnected
                        && stream.tx_waiting.remove(&byte_seq)
                    {
                        requeue_segment(
                            stream,
                            TxSegment {
                                byte_seq,
                                payload,
                                flags,
                                reliable: true,
                            },
                        );
                        self.enqueue_stream(set, key);
                    }
                }
            }
            Frame::Init {
                byte_seq,
                flags,
                payload,
                ..
            }
            | Frame::Reply {
                byte_seq,
                flags,
                payload,
                ..
            } => {
                if let Some(stream) = set.get_mut(key) {
                    if stream.state != StreamState::Disconnected {
                        let byte_seq = u32::from(byte_seq);
                        if stream.tx_waiting.remove(&byte_seq) || payload.is_empty() {
                            if !payload.is_empty() {
                                requeue_segment(
                                    stream,
                                    TxSegment {
                                        byte_seq,
                                        payload,
                                        flags,
                                        reliable: true,
                                    },
                                );
                            }
                            // The binding itself needs re-announcing.
                            if let Some(att) = stream.current_tx_mut() {
                                if !att.is_acked() {
                                    att.set_attaching(att.sid);
                                }
                            }
                            self.enqueue_stream(set, key);
                        }
                    }
                }
            }
            Frame::Attach { sid, .. } => {
                if let Some(stream) = set.get_mut(key) {
                    if stream.state != StreamState::Disconnected {
                        if let Some(att) = stream.current_tx_mut() {
                            if !att.is_acked() && att.sid == sid {
                                att.set_attaching(sid);
                            }
                        }
                        self.enqueue_stream(set, key);
                    }
                }
            }
            Frame::Reset { .. } => {
                self.queue_control(key, rec.frame);
            }
            Frame::Datagram { .. } | Frame::Ack { .. } | Frame::Detach { .. } => {}
        }
    }

    /// Route one delivered frame.
    #[allow(clippy::too_many_lines)]
    pub fn route_frame(
        &mut self,
        set: &mut StreamSet,
        pktseq: PacketSeq,
        frame: Frame,
        events: &mut Vec<StreamEvent>,
    ) {
        match frame {
            Frame::Init {
                parent_sid,
                new_sid,
                byte_seq,
                flags,
                payload,
                ..
            } => {
                self.ack_sid = new_sid;
                if let Some(&child) = self.receive_sids.get(&new_sid) {
                    // Duplicate or continuing Init: deliver by offset.
                    self.deliver_data(set, child, new_sid, pktseq, u32::from(byte_seq), &payload, flags, events);
                    return;
                }
                let Some(&parent_key) = self.receive_sids.get(&parent_sid) else {
                    warn!(parent_sid, new_sid, "init for unknown parent");
                    self.queue_control(
                        self.root_key,
                        Frame::Reset {
                            sid: new_sid,
                            flags: FLAG_RESET_REMOTE,
                        },
                    );
                    return;
                };
                let child = self.accept_child(
                    set,
                    parent_key,
                    UniqueStreamId::new(u32::from(new_sid), self.rx_channel_id),
                    new_sid,
                    pktseq,
                    events,
                );
                self.deliver_data(set, child, new_sid, pktseq, u32::from(byte_seq), &payload, flags, events);
            }
            Frame::Reply {
                remote_sid,
                new_sid,
                byte_seq,
                flags,
                payload,
                ..
            } => {
                self.ack_sid = new_sid;
                let Some(&key) = self.transmit_sids.get(&remote_sid) else {
                    warn!(remote_sid, "reply for unknown stream");
                    self.queue_control(
                        self.root_key,
                        Frame::Reset {
                            sid: new_sid,
                            flags: FLAG_RESET_REMOTE,
                        },
                    );
                    return;
                };
                if let Some(stream) = set.get_mut(key) {
                    if let Some(slot) = stream.rx_attachments.iter_mut().find(|a| !a.is_active() || a.sid == new_sid) {
                        slot.set_active(new_sid, pktseq);
                    }
                    if stream.state == StreamState::Attaching {
                        stream.state = StreamState::Connected;
                    }
                }
                self.receive_sids.insert(new_sid, key);
                self.deliver_data(set, key, new_sid, pktseq, u32::from(byte_seq), &payload, flags, events);
            }
            Frame::Data {
                sid,
                byte_seq,
                window,
                flags,
                payload,
            } => {
                self.ack_sid = sid;
                let Some(&key) = self.receive_sids.get(&sid) else {
                    self.reset_unknown(sid);
                    return;
                };
                if let Some(stream) = set.get_mut(key) {
                    stream.tx_window = decode_window(window);
                }
                self.deliver_data(set, key, sid, pktseq, byte_seq, &payload, flags, events);
            }
            Frame::Datagram { sid, payload, .. } => {
                self.ack_sid = sid;
                let Some(&key) = self.receive_sids.get(&sid) else {
                    self.reset_unknown(sid);
                    return;
                };
                if let Some(stream) = set.get_mut(key) {
                    stream.rx_datagram(&payload);
                    events.push(StreamEvent::DatagramAvailable { stream: key });
                }
            }
            Frame::Ack { sid, window } => {
                if let Some(&key) = self.transmit_sids.get(&sid) {
                    let mut resume = false;
                    if let Some(stream) = set.get_mut(key) {
                        stream.tx_window = decode_window(window);
                        resume = stream.has_work() && !stream.tx_enqueued;
                    }
                    if resume {
                        self.enqueue_stream(set, key);
                    }
                }
            }
            Frame::Reset { sid, flags } => {
                let key = if flags & FLAG_RESET_REMOTE != 0 {
                    self.transmit_sids.get(&sid).copied()
                } else {
                    self.receive_sids.get(&sid).copied()
                };
                let Some(key) = key else { return };
                if key == self.root_key {
                    return;
                }
                debug!(sid, "stream reset by peer");
                if let Some(stream) = set.get_mut(key) {
                    stream.fail("reset by peer");
                    stream.clear_attachments();
                }
                self.forget_stream(key);
                events.push(StreamEvent::Reset { stream: key });
            }
            Frame::Attach {
                sid,
                init,
                usid,
                parent_usid,
                ..
            } => {
                if let Some(key) = set.by_usid(&usid) {
                    // Known stream: (re)activate the rx binding. A
                    // duplicate attach is idempotent via the slot's
                    // sid_seq minimum.
                    if let Some(stream) = set.get_mut(key) {
                        if let Some(slot) = stream
                            .rx_attachments
                            .iter_mut()
                            .find(|a| a.sid == sid && a.is_active())
                        {
                            slot.set_active(sid, pktseq);
                        } else if let Some(slot) =
                            stream.rx_attachments.iter_mut().find(|a| !a.is_active())
                        {
                            slot.set_active(sid, pktseq);
                        }
                    }
                    self.receive_sids.insert(sid, key);
                } else if init {
                    let parent = parent_usid.and_then(|p| set.by_usid(&p));
                    let Some(parent_key) = parent else {
                        self.reset_unknown(sid);
                        return;
                    };
                    self.accept_child(set, parent_key, usid, sid, pktseq, events);
                } else {
                    // Unknown USID and not an init: the stream is gone.
                    self.reset_unknown(sid);
                }
            }
            Frame::Detach { sid, .. } => {
                if let Some(key) = self.receive_sids.remove(&sid) {
                    if let Some(stream) = set.get_mut(key) {
                        if let Some(slot) = stream
                            .rx_attachments
                            .iter_mut()
                            .find(|a| a.is_active() && a.sid == sid)
                        {
                            slot.clear();
                        }
                    }
                }
            }
        }
    }

    /// Create and bind a peer-initiated child stream.
    fn accept_child(
        &mut self,
        set: &mut StreamSet,
        parent_key: StreamKey,
        usid: UniqueStreamId,
        sid: u16,
        pktseq: PacketSeq,
        events: &mut Vec<StreamEvent>,
    ) -> StreamKey {
        let top_level = parent_key == self.root_key;
        let mut child = BaseStream::new(Some(parent_key), top_level, false);
        child.usid = Some(usid);
        child.parent_usid = set.get(parent_key).and_then(|p| p.usid);
        child.state = if top_level {
            StreamState::Accepting
        } else {
            StreamState::Connected
        };
        child.rx_attachments[0].set_active(sid, pktseq);
        let child_key = set.insert(child);
        self.receive_sids.insert(sid, child_key);

        if let Some(parent) = set.get_mut(parent_key) {
            parent.received_substreams.push_back(child_key);
        }
        debug!(sid, %usid, "accepted substream");
        events.push(StreamEvent::NewSubstream { parent: parent_key });
        child_key
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver_data(
        &mut self,
        set: &mut StreamSet,
        key: StreamKey,
        sid: u16,
        pktseq: PacketSeq,
        byte_seq: u32,
        payload: &[u8],
        flags: u8,
        events: &mut Vec<StreamEvent>,
    ) {
        let Some(stream) = set.get_mut(key) else { return };
        // Data from before the attachment became valid is a stale replay.
        if let Some(att) = stream
            .rx_attachments
            .iter()
            .find(|a| a.is_active() && a.sid == sid)
        {
            if pktseq < att.sid_seq {
                debug!(sid, pktseq, "stale pre-attach segment dropped");
                return;
            }
        }
        let was_end = stream.at_end();
        if stream.rx_data(byte_seq, payload, flags) {
            events.push(StreamEvent::DataAvailable { stream: key });
        }
        if stream.at_end() && !was_end {
            events.push(StreamEvent::EndOfStream { stream: key });
        }
    }

    fn reset_unknown(&mut self, sid: u16) {
        if self.closed_streams.contains(&sid) {
            return;
        }
        warn!(sid, "frame for unknown stream, resetting");
        self.queue_control(
            self.root_key,
            Frame::Reset {
                sid,
                flags: FLAG_RESET_REMOTE,
            },
        );
    }

    /// Remove every LSID binding of a stream.
    pub fn forget_stream(&mut self, key: StreamKey) {
        self.transmit_sids.retain(|_, &mut k| k != key);
        self.receive_sids.retain(|_, &mut k| k != key);
        self.sending_streams.retain(|&k| k != key);
    }

    /// Tear the channel down: clear both attachment tables and hand every
    /// waiting frame back to its stream. Frames seen here for the first
    /// time return via the missed path; frames already marked late expire.
    pub fn detach_all(&mut self, set: &mut StreamSet) {
        let waiting = std::mem::take(&mut self.waiting_ack);
        debug!(
            frames = waiting.len(),
            "returning channel frames for retransmission"
        );

        for key in set.keys() {
            if let Some(stream) = set.get_mut(key) {
                stream.clear_attachments();
                if stream.state != StreamState::Disconnected && key != self.root_key {
                    stream.state = StreamState::WaitChannel;
                }
            }
        }
        self.transmit_sids.clear();
        self.receive_sids.clear();
        self.sending_streams.clear();
        self.control_queue.clear();

        for (_, mut rec) in waiting {
            if !rec.late {
                rec.late = true;
            }
            self.return_frame_detached(set, rec);
        }

        if let Some(root) = set.get_mut(self.root_key) {
            root.state = StreamState::Disconnected;
        }
        self.channel.stop();
    }

    /// Like `return_frame`, but without re-enqueueing on this (dead)
    /// channel: segments go back to their streams' queues only.
    fn return_frame_detached(&mut self, set: &mut StreamSet, rec: TxRecord) {
        let key = rec.stream;
        match rec.frame {
            Frame::Data {
                byte_seq,
                flags,
                payload,
                ..
            } => {
                if let Some(stream) = set.get_mut(key) {
                    if stream.state != StreamState::Disconnected {
                        stream.tx_waiting.remove(&byte_seq);
                        requeue_segment(
                            stream,
                            TxSegment {
                                byte_seq,
                                payload,
                                flags,
                                reliable: true,
                            },
                        );
                    }
                }
            }
            Frame::Init {
                byte_seq,
                flags,
                payload,
                ..
            }
            | Frame::Reply {
                byte_seq,
                flags,
                payload,
                ..
            } => {
                if let Some(stream) = set.get_mut(key) {
                    if stream.state != StreamState::Disconnected && !payload.is_empty() {
                        let byte_seq = u32::from(byte_seq);
                        stream.tx_waiting.remove(&byte_seq);
                        requeue_segment(
                            stream,
                            TxSegment {
                                byte_seq,
                                payload,
                                flags,
                                reliable: true,
                            },
                        );
                    }
                }
            }
            _ => {}
        }
    }
}

/// Pop the front segment when it is reliable and its offset still fits the
/// 16-bit Init/Reply sequence field.
fn front_reliable_short(stream: &mut BaseStream) -> Option<TxSegment> {
    let front = stream.tx_queue.front()?;
    if front.reliable && front.byte_seq <= 0xffff {
        stream.tx_queue.pop_front()
    } else {
        None
    }
}

/// Insert a returned segment into the transmit queue in byte order.
fn requeue_segment(stream: &mut BaseStream, seg: TxSegment) {
    let pos = stream
        .tx_queue
        .iter()
        .position(|s| s.reliable && s.byte_seq > seg.byte_seq)
        .unwrap_or(stream.tx_queue.len());
    stream.tx_queue.insert(pos, seg);
}
