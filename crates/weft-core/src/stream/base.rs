//! The stream state machine.
//!
//! A stream buffers user writes as segments of at most one MTU payload,
//! hands them to the channel scheduler, and reassembles received segments
//! by byte offset. Substreams, shutdown, and datagram delivery live here;
//! everything involving LSIDs and packets is the multiplexer's business.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::error::StreamError;
use crate::frame::FLAG_DATA_CLOSE;
use crate::stream::attach::{RxAttachment, TxAttachment, MAX_ATTACHMENTS};
use crate::stream::usid::UniqueStreamId;
use crate::stream::StreamKey;

/// Largest stream payload per packet.
pub const MTU_PAYLOAD: usize = 1200;

/// Default advertised receive window.
pub const DEFAULT_RECEIVE_WINDOW: u32 = 256 * 1024;

/// Stream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, nothing attached.
    Fresh,
    /// Waiting for a channel to this peer.
    WaitChannel,
    /// Attachment in progress on the current channel.
    Attaching,
    /// At least one attachment active in each direction.
    Connected,
    /// Peer-created top-level stream awaiting the service request.
    Accepting,
    /// Accepting child streams.
    Listening,
    /// Shut down or failed; will not attach again.
    Disconnected,
}

/// One queued transmit segment.
#[derive(Debug, Clone)]
pub struct TxSegment {
    /// Byte offset of the segment start within the stream.
    pub byte_seq: u32,
    /// Segment payload.
    pub payload: Vec<u8>,
    /// Close/push endflags for the final segment.
    pub flags: u8,
    /// False for datagrams, which are never retransmitted.
    pub reliable: bool,
}

/// One stream endpoint.
pub struct BaseStream {
    /// Globally unique id, assigned at first attach (or on receive).
    pub usid: Option<UniqueStreamId>,
    /// Parent's USID, required to initiate; None for the root.
    pub parent_usid: Option<UniqueStreamId>,
    /// Parent's local key, when the parent is local.
    pub parent_key: Option<StreamKey>,
    /// Lifecycle state.
    pub state: StreamState,
    /// Top-level application stream (parents under the channel root).
    pub top_level: bool,
    /// Stream creation not yet acknowledged by the peer.
    pub init_pending: bool,
    /// Scheduling priority; higher drains first.
    pub priority: i32,
    /// Transmit attachment slots.
    pub tx_attachments: [TxAttachment; MAX_ATTACHMENTS],
    /// Receive attachment slots.
    pub rx_attachments: [RxAttachment; MAX_ATTACHMENTS],
    /// Index of the current transmit attachment, if any.
    pub tx_current_attachment: Option<usize>,
    /// Next byte offset to assign to written data.
    pub tx_byte_seq: u32,
    /// Peer-advertised transmit window, in bytes.
    pub tx_window: u32,
    /// Queued segments not yet transmitted (front is next).
    pub tx_queue: VecDeque<TxSegment>,
    /// Byte offsets of reliable segments in flight.
    pub tx_waiting: BTreeSet<u32>,
    /// On the channel's sending list.
    pub tx_enqueued: bool,
    /// Write side closed.
    pub end_write: bool,
    /// Read side closed or fully delivered.
    pub end_read: bool,

    rx_next_byte: u32,
    rx_ahead: BTreeMap<u32, (Vec<u8>, u8)>,
    rx_available: VecDeque<u8>,
    rx_close_at: Option<u32>,
    /// Received datagram records.
    pub rx_datagrams: VecDeque<Vec<u8>>,
    /// Peer-initiated children awaiting accept.
    pub received_substreams: VecDeque<StreamKey>,
    /// Advertised receive window.
    pub receive_window: u32,
    /// Failure reason, if any.
    pub error: Option<String>,
}

impl BaseStream {
    /// Create a stream. `init` marks locally initiated streams that must
    /// announce themselves to the peer.
    #[must_use]
    pub fn new(parent_key: Option<StreamKey>, top_level: bool, init: bool) -> Self {
        Self {
            usid: None,
            parent_usid: None,
            parent_key,
            state: StreamState::Fresh,
            top_level,
            init_pending: init,
            priority: 0,
            tx_attachments: Default::default(),
            rx_attachments: Default::default(),
            tx_current_attachment: None,
            tx_byte_seq: 0,
            tx_window: DEFAULT_RECEIVE_WINDOW,
            tx_queue: VecDeque::new(),
            tx_waiting: BTreeSet::new(),
            tx_enqueued: false,
            end_write: false,
            end_read: false,
            rx_next_byte: 0,
            rx_ahead: BTreeMap::new(),
            rx_available: VecDeque::new(),
            rx_close_at: None,
            rx_datagrams: VecDeque::new(),
            received_substreams: VecDeque::new(),
            receive_window: DEFAULT_RECEIVE_WINDOW,
            error: None,
        }
    }

    /// The current transmit attachment, if one is in use.
    #[must_use]
    pub fn current_tx(&self) -> Option<&TxAttachment> {
        self.tx_current_attachment
            .map(|i| &self.tx_attachments[i])
    }

    /// Mutable access to the current transmit attachment.
    pub fn current_tx_mut(&mut self) -> Option<&mut TxAttachment> {
        self.tx_current_attachment
            .map(|i| &mut self.tx_attachments[i])
    }

    /// Whether any receive slot is active.
    #[must_use]
    pub fn has_rx_attachment(&self) -> bool {
        self.rx_attachments.iter().any(RxAttachment::is_active)
    }

    /// Find a free transmit slot.
    ///
    /// # Errors
    ///
    /// [`StreamError::SlotsExhausted`] when both slots are busy.
    pub fn free_tx_slot(&self) -> Result<usize, StreamError> {
        self.tx_attachments
            .iter()
            .position(|a| !a.is_in_use())
            .ok_or(StreamError::SlotsExhausted)
    }

    /// Queue user bytes for transmission, segmented at the MTU. The final
    /// segment carries `endflags`; a close flag also closes the write side.
    ///
    /// # Errors
    ///
    /// [`StreamError::WriteAfterClose`] once the write side is closed,
    /// [`StreamError::Disconnected`] after teardown.
    pub fn write_data(&mut self, data: &[u8], endflags: u8) -> Result<usize, StreamError> {
        if self.end_write {
            return Err(StreamError::WriteAfterClose);
        }
        if self.state == StreamState::Disconnected {
            return Err(StreamError::Disconnected(
                self.error.clone().unwrap_or_default(),
            ));
        }

        let mut offset = 0;
        loop {
            let remaining = data.len() - offset;
            let take = remaining.min(MTU_PAYLOAD);
            let last = remaining <= MTU_PAYLOAD;
            self.tx_queue.push_back(TxSegment {
                byte_seq: self.tx_byte_seq,
                payload: data[offset..offset + take].to_vec(),
                flags: if last { endflags } else { 0 },
                reliable: true,
            });
            self.tx_byte_seq = self.tx_byte_seq.wrapping_add(take as u32);
            offset += take;
            if last {
                break;
            }
        }
        if endflags & FLAG_DATA_CLOSE != 0 {
            self.end_write = true;
        }
        debug!(bytes = data.len(), queued = self.tx_queue.len(), "write_data");
        Ok(data.len())
    }

    /// Queue one unreliable record.
    ///
    /// # Errors
    ///
    /// As for [`BaseStream::write_data`].
    pub fn write_datagram(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.end_write {
            return Err(StreamError::WriteAfterClose);
        }
        if self.state == StreamState::Disconnected {
            return Err(StreamError::Disconnected(
                self.error.clone().unwrap_or_default(),
            ));
        }
        self.tx_queue.push_back(TxSegment {
            byte_seq: 0,
            payload: data.to_vec(),
            flags: 0,
            reliable: false,
        });
        Ok(())
    }

    /// Accept a received reliable segment. Returns true when new bytes
    /// became readable in order.
    pub fn rx_data(&mut self, byte_seq: u32, payload: &[u8], flags: u8) -> bool {
        if self.end_read {
            return false;
        }
        let end = byte_seq.wrapping_add(payload.len() as u32);
        if flags & FLAG_DATA_CLOSE != 0 {
            self.rx_close_at = Some(end);
        }

        if end <= self.rx_next_byte && !(payload.is_empty() && byte_seq == self.rx_next_byte) {
            // Entirely old: duplicate segment.
            debug!(byte_seq, "duplicate segment dropped");
            self.check_close();
            return false;
        }

        if byte_seq > self.rx_next_byte {
            // Out of order: buffer, first copy wins.
            self.rx_ahead
                .entry(byte_seq)
                .or_insert_with(|| (payload.to_vec(), flags));
            return false;
        }

        // In order, possibly overlapping the already-delivered prefix.
        let skip = (self.rx_next_byte - byte_seq) as usize;
        self.rx_available.extend(&payload[skip..]);
        self.rx_next_byte = end;
        self.drain_ahead();
        self.check_close();
        true
    }

    fn drain_ahead(&mut self) {
        while let Some((&seq, _)) = self.rx_ahead.first_key_value() {
            if seq > self.rx_next_byte {
                break;
            }
            let Some((_, (payload, flags))) = self.rx_ahead.pop_first() else {
                break;
            };
            let end = seq.wrapping_add(payload.len() as u32);
            if end > self.rx_next_byte {
                let skip = (self.rx_next_byte - seq) as usize;
                self.rx_available.extend(&payload[skip..]);
                self.rx_next_byte = end;
            }
            if flags & FLAG_DATA_CLOSE != 0 {
                self.rx_close_at = Some(end);
            }
        }
    }

    fn check_close(&mut self) {
        if let Some(at) = self.rx_close_at {
            if self.rx_next_byte >= at {
                self.end_read = true;
            }
        }
    }

    /// Accept a received datagram record.
    pub fn rx_datagram(&mut self, payload: &[u8]) {
        if !self.end_read {
            self.rx_datagrams.push_back(payload.to_vec());
        }
    }

    /// Bytes readable in order.
    #[must_use]
    pub fn bytes_available(&self) -> usize {
        self.rx_available.len()
    }

    /// Whether all data up to the peer's close has been read.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.end_read && self.rx_available.is_empty()
    }

    /// Read up to `max` in-order bytes.
    pub fn read_data(&mut self, max: usize) -> Vec<u8> {
        let take = max.min(self.rx_available.len());
        self.rx_available.drain(..take).collect()
    }

    /// Read one datagram record, if any.
    pub fn read_datagram(&mut self) -> Option<Vec<u8>> {
        self.rx_datagrams.pop_front()
    }

    /// Whether the stream has anything to put on the wire.
    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.tx_queue.is_empty()
    }

    /// Fail the stream, recording the reason.
    pub fn fail(&mut self, reason: &str) {
        debug!(reason, "stream failed");
        self.state = StreamState::Disconnected;
        self.error = Some(reason.to_string());
        self.tx_queue.clear();
        self.tx_enqueued = false;
    }

    /// Clear every attachment slot (channel teardown).
    pub fn clear_attachments(&mut self) {
        for slot in &mut self.tx_attachments {
            slot.clear();
        }
        for slot in &mut self.rx_attachments {
            slot.clear();
        }
        self.tx_current_attachment = None;
        self.tx_enqueued = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FLAG_DATA_PUSH;

    #[test]
    fn write_segments_at_mtu() {
        let mut s = BaseStream::new(None, true, true);
        s.write_data(&vec![7u8; MTU_PAYLOAD * 2 + 10], FLAG_DATA_PUSH)
            .unwrap();
        assert_eq!(s.tx_queue.len(), 3);
        assert_eq!(s.tx_queue[0].byte_seq, 0);
        assert_eq!(s.tx_queue[1].byte_seq, MTU_PAYLOAD as u32);
        assert_eq!(s.tx_queue[2].payload.len(), 10);
        // Only the final segment carries the endflags.
        assert_eq!(s.tx_queue[0].flags, 0);
        assert_eq!(s.tx_queue[2].flags, FLAG_DATA_PUSH);
    }

    #[test]
    fn close_flag_closes_write_side() {
        let mut s = BaseStream::new(None, true, true);
        s.write_data(b"bye", FLAG_DATA_CLOSE).unwrap();
        assert!(s.write_data(b"more", 0).is_err());
    }

    #[test]
    fn in_order_reassembly() {
        let mut s = BaseStream::new(None, true, false);
        assert!(s.rx_data(0, b"hello ", 0));
        assert!(s.rx_data(6, b"world", 0));
        assert_eq!(s.read_data(64), b"hello world");
    }

    #[test]
    fn out_of_order_buffered_and_drained() {
        let mut s = BaseStream::new(None, true, false);
        assert!(!s.rx_data(6, b"world", 0));
        assert_eq!(s.bytes_available(), 0);
        assert!(s.rx_data(0, b"hello ", 0));
        assert_eq!(s.read_data(64), b"hello world");
    }

    #[test]
    fn duplicates_and_overlaps_deliver_once() {
        let mut s = BaseStream::new(None, true, false);
        s.rx_data(0, b"abcd", 0);
        // Exact duplicate.
        assert!(!s.rx_data(0, b"abcd", 0));
        // Overlapping extension delivers only the new tail.
        s.rx_data(2, b"cdef", 0);
        assert_eq!(s.read_data(64), b"abcdef");
    }

    #[test]
    fn close_reaches_end_after_gap_fills() {
        let mut s = BaseStream::new(None, true, false);
        s.rx_data(4, b"tail", FLAG_DATA_CLOSE);
        assert!(!s.end_read);
        s.rx_data(0, b"head", 0);
        assert!(s.end_read);
        assert_eq!(s.read_data(64), b"headtail");
        assert!(s.at_end());
    }

    #[test]
    fn empty_close_segment_ends_stream() {
        let mut s = BaseStream::new(None, true, false);
        s.rx_data(0, b"data", 0);
        s.rx_data(4, b"", FLAG_DATA_CLOSE);
        assert!(s.end_read);
    }
}
