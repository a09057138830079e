//! The channel packet engine.
//!
//! A channel is an encrypted, sequenced packet pipe between two hosts.
//! This module owns the 64-bit sequence space, the sliding replay window,
//! selective acknowledgment, loss inference, expiry of transmit records,
//! the retransmission and delayed-ack timers, and the congestion window.
//!
//! The engine is sans-IO: `transmit_*` return wire bytes for the caller to
//! send, `receive` returns the decrypted packet plus the acknowledgment
//! events it implies, and timers are driven by `poll_timers`. Events from
//! one received packet are always consumed before the next packet is
//! processed, which serializes ack handling per channel.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::armor::ChannelArmor;
use crate::congestion::CongestionStrategy;
use crate::error::ChannelError;
use crate::timer::Timer;

/// 64-bit packet sequence number.
pub type PacketSeq = u64;

/// Channel header size: 4 clear bytes + 4 encrypted bytes.
pub const CHANNEL_HEADER_SIZE: usize = 8;

/// Hard transmit limit: no rekey protocol exists, so a channel refuses to
/// approach the end of its nonce space.
pub const MAX_PACKET_SEQ: PacketSeq = 1 << 63;

/// Width of the selective-ack and replay bitmaps.
const MASK_BITS: u32 = 32;

/// Saturation value of the contiguous-packet ack counter.
const MAX_ACK_COUNT: u8 = 0xf;

/// Received data packets before the delayed ack must flush.
const MAX_ACK_PACKETS: u8 = 4;

/// Received packets below which the ack timer runs the full delay.
const MIN_ACK_PACKETS: u8 = 2;

/// Delayed-ack coalescing interval for data packets.
const ACK_DELAY: Duration = Duration::from_millis(10);

/// Initial smoothed round-trip estimate.
const INITIAL_RTT: Duration = Duration::from_millis(500);

/// Retransmission timer backoff cap.
const RETRANSMIT_CAP: Duration = Duration::from_secs(30);

/// Cumulative stall before the link is declared down.
const LINK_DOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Unacknowledged distance at which loss is inferred.
const MISS_THRESHOLD: u64 = 3;

/// Link status as seen by the stream layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Acknowledgments are flowing.
    Up,
    /// Retransmission timeouts without progress.
    Stalled,
    /// Stalled past the link-down threshold; the channel must be torn down.
    Down,
}

/// Record of one transmitted packet, kept until it leaves the ack window.
#[derive(Debug, Clone, Copy)]
struct TransmitEvent {
    size: u32,
    /// Data packet still counted toward the in-flight pipe.
    pipe: bool,
}

impl TransmitEvent {
    fn new(size: u32, is_data: bool) -> Self {
        Self {
            size,
            pipe: is_data,
        }
    }
}

/// Upcalls implied by received acknowledgment state, in firing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Packets `txseq .. txseq+npackets` were acknowledged; `rxackseq` is
    /// the peer packet that carried the acknowledgment.
    Acknowledged {
        /// First acknowledged transmit sequence.
        txseq: PacketSeq,
        /// Run length.
        npackets: u32,
        /// Sequence of the acknowledging packet.
        rxackseq: PacketSeq,
    },
    /// Packets presumed lost. The stream layer decides about retransmission.
    Missed {
        /// First missed transmit sequence.
        txseq: PacketSeq,
        /// Run length.
        npackets: u32,
    },
    /// Packets that left the ack window; no acknowledgment can arrive now.
    Expired {
        /// First expired transmit sequence.
        txseq: PacketSeq,
        /// Run length.
        npackets: u32,
    },
    /// The window opened; the scheduler may transmit again.
    ReadyTransmit,
    /// Link status transition.
    StatusChanged(LinkStatus),
}

/// An acknowledgment the caller must put on the wire now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckSend {
    /// Highest contiguous received sequence to acknowledge.
    pub ackseq: PacketSeq,
    /// Saturating count of contiguous packets before `ackseq`.
    pub ack_count: u8,
}

/// Result of successfully receiving one packet.
#[derive(Debug)]
pub struct ReceiveResult {
    /// Reconstructed 64-bit sequence of the packet.
    pub pktseq: PacketSeq,
    /// Decrypted packet (8-byte header followed by the stream frame).
    pub payload: Vec<u8>,
    /// Acknowledgment events, in order.
    pub events: Vec<ChannelEvent>,
}

/// Result of a timer poll.
#[derive(Debug, Default)]
pub struct TimerPoll {
    /// Acks to transmit now.
    pub acks: Vec<AckSend>,
    /// Missed/ready/status events from a retransmission timeout.
    pub events: Vec<ChannelEvent>,
}

/// One encrypted, sequenced packet pipe.
pub struct Channel {
    local_channel: u8,
    remote_channel: u8,
    armor: Box<dyn ChannelArmor>,
    congestion: Box<dyn CongestionStrategy>,
    active: bool,
    status: LinkStatus,

    // Transmit state
    tx_sequence: PacketSeq,
    tx_events: VecDeque<TransmitEvent>,
    tx_event_sequence: PacketSeq,
    tx_ack_sequence: PacketSeq,
    tx_ack_mask: u32,
    tx_inflight_count: u32,
    tx_inflight_size: u32,
    cwnd_limited: bool,

    // RTT mark
    mark_sequence: PacketSeq,
    mark_time: Instant,
    mark_base: PacketSeq,
    mark_acks: u32,
    mark_sent: u32,
    cumulative_rtt: Duration,

    retransmit_timer: Timer,
    /// Time spent in consecutive retransmission timeouts.
    stall_time: Duration,

    // Receive state
    rx_sequence: PacketSeq,
    rx_mask: u32,
    rx_ack_sequence: PacketSeq,
    rx_ack_count: u8,
    rx_unacked: u8,
    ack_timer: Timer,
}

impl Channel {
    /// Create a channel. `local_channel` labels packets the peer sends us;
    /// `remote_channel` labels packets we send (here they are the same
    /// negotiated number, kept separate for clarity).
    pub fn new(
        local_channel: u8,
        remote_channel: u8,
        armor: Box<dyn ChannelArmor>,
        congestion: Box<dyn CongestionStrategy>,
        now: Instant,
    ) -> Self {
        let mut tx_events = VecDeque::new();
        // Sequence 0 is never transmitted; a placeholder event keeps the
        // invariant tx_event_sequence + len == tx_sequence.
        tx_events.push_back(TransmitEvent::new(0, false));

        Self {
            local_channel,
            remote_channel,
            armor,
            congestion,
            active: false,
            status: LinkStatus::Down,
            tx_sequence: 1,
            tx_events,
            tx_event_sequence: 0,
            tx_ack_sequence: 0,
            tx_ack_mask: 0,
            tx_inflight_count: 0,
            tx_inflight_size: 0,
            cwnd_limited: false,
            mark_sequence: 1,
            mark_time: now,
            mark_base: 0,
            mark_acks: 0,
            mark_sent: 0,
            cumulative_rtt: INITIAL_RTT,
            retransmit_timer: Timer::default(),
            stall_time: Duration::ZERO,
            rx_sequence: 0,
            rx_mask: 0,
            rx_ack_sequence: 0,
            rx_ack_count: 0,
            rx_unacked: 0,
            ack_timer: Timer::default(),
        }
    }

    /// Activate the channel.
    pub fn start(&mut self) {
        debug!(chan = self.local_channel, "channel start");
        self.active = true;
        self.status = LinkStatus::Up;
    }

    /// Deactivate: stop timers, mark the link down.
    pub fn stop(&mut self) {
        debug!(chan = self.local_channel, "channel stop");
        self.active = false;
        self.retransmit_timer.stop();
        self.ack_timer.stop();
        self.status = LinkStatus::Down;
    }

    /// Whether the channel is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current link status.
    #[must_use]
    pub fn link_status(&self) -> LinkStatus {
        self.status
    }

    /// Our channel number on the peer's socket.
    #[must_use]
    pub fn local_channel(&self) -> u8 {
        self.local_channel
    }

    /// Smoothed round-trip estimate.
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.cumulative_rtt
    }

    /// Next transmit sequence (diagnostics and tests).
    #[must_use]
    pub fn tx_sequence(&self) -> PacketSeq {
        self.tx_sequence
    }

    /// Highest contiguous received sequence acknowledged so far.
    #[must_use]
    pub fn rx_ack_state(&self) -> (PacketSeq, u8) {
        (self.rx_ack_sequence, self.rx_ack_count)
    }

    /// How many packets the congestion window allows right now. Latches
    /// `cwnd_limited` when the answer is zero.
    pub fn may_transmit(&mut self) -> u32 {
        let cwnd = self.congestion.window();
        if cwnd > self.tx_inflight_count {
            cwnd - self.tx_inflight_count
        } else {
            self.cwnd_limited = true;
            0
        }
    }

    /// Whether the window limited transmission since the last ack.
    #[must_use]
    pub fn is_cwnd_limited(&self) -> bool {
        self.cwnd_limited
    }

    fn first_header_word(&self, tx_sequence: PacketSeq) -> u32 {
        (u32::from(self.remote_channel) << 24) | (tx_sequence as u32 & 0x00ff_ffff)
    }

    fn second_header_word(ack_count: u8, ack_sequence: PacketSeq) -> u32 {
        (u32::from(ack_count & MAX_ACK_COUNT) << 24) | (ack_sequence as u32 & 0x00ff_ffff)
    }

    /// Transmit an upper-layer data packet. `packet` holds 8 reserved
    /// header bytes followed by the stream frame; the filled-in, encrypted
    /// wire bytes and the consumed sequence number are returned.
    ///
    /// Piggybacks the current receive-ack state and cancels any pending
    /// delayed ack.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Inactive`] before `start`/after `stop`;
    /// [`ChannelError::SequenceExhausted`] at the hard sequence limit.
    pub fn transmit_data(
        &mut self,
        packet: Vec<u8>,
        now: Instant,
    ) -> Result<(PacketSeq, Vec<u8>), ChannelError> {
        debug_assert!(packet.len() > CHANNEL_HEADER_SIZE);

        let ack_word = Self::second_header_word(self.rx_ack_count, self.rx_ack_sequence);
        if self.rx_unacked > 0 {
            self.rx_unacked = 0;
            self.ack_timer.stop();
        }

        let result = self.transmit_inner(packet, ack_word, true, now)?;

        if !self.retransmit_timer.is_active() {
            self.start_retransmit_timer(now);
        }
        Ok(result)
    }

    /// Transmit an acknowledgment-only packet (the caller supplies the
    /// stream Ack frame after the 8 header bytes, or an empty vector for a
    /// bare header).
    ///
    /// # Errors
    ///
    /// As for [`Channel::transmit_data`].
    pub fn transmit_ack_packet(
        &mut self,
        mut packet: Vec<u8>,
        ackseq: PacketSeq,
        ack_count: u8,
        now: Instant,
    ) -> Result<(PacketSeq, Vec<u8>), ChannelError> {
        if packet.len() < CHANNEL_HEADER_SIZE {
            packet.resize(CHANNEL_HEADER_SIZE, 0);
        }
        let ack_word = Self::second_header_word(ack_count, ackseq);
        self.transmit_inner(packet, ack_word, false, now)
    }

    fn transmit_inner(
        &mut self,
        mut packet: Vec<u8>,
        ack_word: u32,
        is_data: bool,
        now: Instant,
    ) -> Result<(PacketSeq, Vec<u8>), ChannelError> {
        if !self.active {
            return Err(ChannelError::Inactive);
        }
        let pktseq = self.tx_sequence;
        if pktseq >= MAX_PACKET_SEQ {
            return Err(ChannelError::SequenceExhausted);
        }

        let word0 = self.first_header_word(pktseq);
        packet[0..4].copy_from_slice(&word0.to_be_bytes());
        packet[4..8].copy_from_slice(&ack_word.to_be_bytes());

        let wire = self.armor.transmit_encode(pktseq, &packet)?;

        // Past this point the sequence number is consumed even if the
        // caller fails to put the bytes on the wire.
        if self.tx_sequence == self.mark_sequence {
            self.mark_time = now;
            self.mark_acks = 0;
            self.mark_base = self.tx_ack_sequence;
            self.mark_sent = (self.tx_sequence - self.tx_ack_sequence) as u32;
        }
        self.tx_sequence += 1;

        let event = TransmitEvent::new(packet.len() as u32, is_data);
        if is_data {
            self.tx_inflight_count += 1;
            self.tx_inflight_size += event.size;
        }
        self.tx_events.push_back(event);
        debug_assert_eq!(
            self.tx_event_sequence + self.tx_events.len() as u64,
            self.tx_sequence
        );
        debug_assert!(self.tx_inflight_count as usize <= self.tx_events.len());

        debug!(
            chan = self.local_channel,
            seq = pktseq,
            size = wire.len(),
            is_data,
            "channel transmit"
        );
        Ok((pktseq, wire))
    }

    fn start_retransmit_timer(&mut self, now: Instant) {
        self.retransmit_timer.start(now, self.cumulative_rtt * 2);
    }

    /// Process one received wire packet.
    ///
    /// # Errors
    ///
    /// [`ChannelError::PacketDropped`] covers every drop decision: runt,
    /// out-of-window, duplicate, authentication failure, and acks for
    /// untransmitted packets. The caller logs nothing further and sends
    /// nothing back.
    pub fn receive(&mut self, pkt: &[u8], now: Instant) -> Result<ReceiveResult, ChannelError> {
        if !self.active {
            warn!(chan = self.local_channel, "receive on inactive channel");
            return Err(ChannelError::Inactive);
        }
        if pkt.len() < CHANNEL_HEADER_SIZE {
            warn!(chan = self.local_channel, "runt packet");
            return Err(ChannelError::PacketDropped);
        }

        // Reconstruct the 64-bit packet sequence from the low 24 wire bits.
        let word0 = u32::from_be_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]);
        let pktchan = (word0 >> 24) as u8;
        if pktchan != self.local_channel {
            warn!(
                chan = self.local_channel,
                pktchan, "packet for wrong channel"
            );
            return Err(ChannelError::PacketDropped);
        }

        let seqdiff = seq_diff24(word0 & 0x00ff_ffff, self.rx_sequence);
        let pktseq = self.rx_sequence.wrapping_add_signed(i64::from(seqdiff));
        debug!(
            chan = self.local_channel,
            seq = pktseq,
            size = pkt.len(),
            "channel receive"
        );

        // Drop too-old and already-received packets before paying for
        // authentication of obviously dead traffic. Authentication still
        // precedes any window update.
        if seqdiff > 0 {
            if pktseq < self.rx_sequence {
                warn!("64-bit sequence wraparound detected, dropping");
                return Err(ChannelError::PacketDropped);
            }
        } else if seqdiff <= -(MASK_BITS as i32) {
            debug!("too-old packet dropped");
            return Err(ChannelError::PacketDropped);
        } else if self.rx_mask & (1u32 << (-seqdiff) as u32) != 0 {
            debug!("duplicate packet dropped");
            return Err(ChannelError::PacketDropped);
        }

        let payload = match self.armor.receive_decode(pktseq, pkt) {
            Ok(p) => p,
            Err(_) => {
                warn!(seq = pktseq, "packet authentication failed");
                return Err(ChannelError::PacketDropped);
            }
        };
        if payload.len() < CHANNEL_HEADER_SIZE {
            warn!("runt plaintext");
            return Err(ChannelError::PacketDropped);
        }

        // The packet is authentic: record it for replay protection.
        if seqdiff > 0 {
            self.rx_sequence = pktseq;
            if (seqdiff as u32) < MASK_BITS {
                self.rx_mask = (self.rx_mask << seqdiff) | 1;
            } else {
                self.rx_mask = 1;
            }
        } else {
            self.rx_mask |= 1u32 << (-seqdiff) as u32;
        }

        // Acknowledgment word travels encrypted.
        let word1 = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let ackct = u32::from((word1 >> 24) & 0xf);
        let mut ack_diff = i64::from(seq_diff24(word1 & 0x00ff_ffff, self.tx_ack_sequence));
        let ackseq = self.tx_ack_sequence.wrapping_add_signed(ack_diff);

        if ackseq >= self.tx_sequence {
            warn!(ackseq, "ack for untransmitted packet, dropping");
            return Err(ChannelError::PacketDropped);
        }

        let mut events = Vec::new();
        let mut new_packets: u32 = 0;
        let mut missed_any = false;
        let mut rtt_sample = None;

        if ack_diff > 0 {
            // New contiguous acknowledgment: roll the window forward.
            self.tx_ack_sequence = ackseq;
            if ack_diff < i64::from(MASK_BITS) {
                self.tx_ack_mask <<= ack_diff as u32;
            } else {
                self.tx_ack_mask = 0;
            }

            new_packets = (ack_diff as u64).min(u64::from(ackct) + 1) as u32;
            self.tx_ack_mask |= (1u32 << new_packets) - 1;

            let first = self.tx_ack_sequence - u64::from(new_packets) + 1;
            for seq in first..=self.tx_ack_sequence {
                if self.clear_pipe(seq) {
                    events.push(ChannelEvent::Acknowledged {
                        txseq: seq,
                        npackets: 1,
                        rxackseq: pktseq,
                    });
                }
            }

            // Infer losses: packets that stayed unacknowledged while the
            // ack window moved miss_threshold past them.
            let miss_lim = self
                .tx_ack_sequence
                .saturating_sub(MISS_THRESHOLD.max(u64::from(new_packets)));
            let miss_start = self
                .tx_ack_sequence
                .saturating_sub(MISS_THRESHOLD + ack_diff as u64 - 1);
            let mut miss_seq = miss_start;
            while miss_seq <= miss_lim {
                if self.clear_pipe(miss_seq) {
                    missed_any = true;
                    events.push(ChannelEvent::Missed {
                        txseq: miss_seq,
                        npackets: 1,
                    });
                    debug!(seq = miss_seq, inflight = self.tx_inflight_count, "inferred drop");
                }
                miss_seq += 1;
            }

            // Expire transmit records leaving the ack window; they can
            // never be acknowledged once the mask has moved past them.
            if self.tx_ack_sequence > u64::from(MASK_BITS) {
                while self.tx_event_sequence <= self.tx_ack_sequence - u64::from(MASK_BITS) {
                    if let Some(front) = self.tx_events.front() {
                        debug_assert!(!front.pipe);
                    }
                    self.tx_events.pop_front();
                    self.tx_event_sequence += 1;
                    events.push(ChannelEvent::Expired {
                        txseq: self.tx_event_sequence - 1,
                        npackets: 1,
                    });
                }
            }

            // Mark round trip: the first ack at or past the mark closes
            // an RTT measurement and plants the next mark.
            if self.tx_ack_sequence >= self.mark_sequence {
                let sample = now.saturating_duration_since(self.mark_time);
                self.cumulative_rtt = (self.cumulative_rtt * 7 + sample) / 8;
                rtt_sample = Some(sample);
                self.mark_sequence = self.tx_sequence;
            }

            // Progress: the link is up and the stall clock resets.
            self.stall_time = Duration::ZERO;
            if self.status != LinkStatus::Up {
                self.status = LinkStatus::Up;
                events.push(ChannelEvent::StatusChanged(LinkStatus::Up));
            }
            if self.tx_inflight_count > 0 {
                self.start_retransmit_timer(now);
            } else {
                self.retransmit_timer.stop();
            }

            ack_diff = 0;
        }

        // Straggling out-of-order acknowledgments within the mask.
        let newmask = (1u32 << ackct) - 1;
        if (self.tx_ack_mask & newmask) != newmask {
            for i in 0..=ackct {
                let bit = (-ack_diff) as u32 + i;
                if bit >= MASK_BITS || u64::from(bit) > self.tx_ack_sequence {
                    break;
                }
                if self.tx_ack_mask & (1 << bit) != 0 {
                    continue;
                }
                self.tx_ack_mask |= 1 << bit;

                let seq = self.tx_ack_sequence - u64::from(bit);
                if self.clear_pipe(seq) {
                    events.push(ChannelEvent::Acknowledged {
                        txseq: seq,
                        npackets: 1,
                        rxackseq: pktseq,
                    });
                }
                new_packets += 1;
            }
        }

        self.mark_acks += new_packets;
        if new_packets > 0 {
            self.congestion.on_ack(new_packets, rtt_sample);
            self.cwnd_limited = false;
        }
        if missed_any {
            self.congestion.on_missed();
        }

        if new_packets > 0 && self.may_transmit() > 0 {
            events.push(ChannelEvent::ReadyTransmit);
        }

        Ok(ReceiveResult {
            pktseq,
            payload,
            events,
        })
    }

    /// Clear the pipe flag of the transmit record at `seq` if set,
    /// updating the in-flight accounting. Returns whether it was set.
    fn clear_pipe(&mut self, seq: PacketSeq) -> bool {
        if seq < self.tx_event_sequence {
            return false;
        }
        let idx = (seq - self.tx_event_sequence) as usize;
        match self.tx_events.get_mut(idx) {
            Some(e) if e.pipe => {
                e.pipe = false;
                self.tx_inflight_count -= 1;
                self.tx_inflight_size -= e.size;
                true
            }
            _ => false,
        }
    }

    /// Update receive-side ack state for a delivered packet and decide
    /// what to acknowledge right now. `send_ack` is false for packets that
    /// carried nothing but an acknowledgment (acks of acks are only sent
    /// occasionally).
    pub fn acknowledge(&mut self, pktseq: PacketSeq, send_ack: bool, now: Instant) -> Vec<AckSend> {
        debug!(
            chan = self.local_channel,
            seq = pktseq,
            send_ack,
            "acknowledge"
        );
        let mut out = Vec::new();
        let seq_diff = pktseq.wrapping_sub(self.rx_ack_sequence) as i64;

        if seq_diff == 1 {
            // In order and contiguous.
            self.rx_ack_sequence = pktseq;
            self.rx_ack_count = self.rx_ack_count.saturating_add(1).min(MAX_ACK_COUNT);

            self.rx_unacked += 1;
            if !send_ack && self.rx_unacked < MAX_ACK_PACKETS {
                return out;
            }
            if self.rx_unacked < MAX_ACK_PACKETS {
                // Schedule rather than send, so several acks can coalesce.
                if self.rx_unacked < MIN_ACK_PACKETS {
                    if !self.ack_timer.is_active() {
                        self.ack_timer.start(now, ACK_DELAY);
                    }
                } else {
                    self.ack_timer.start(now, Duration::ZERO);
                }
            } else {
                self.flush_ack(&mut out);
            }
        } else if seq_diff > 1 {
            // In order but discontiguous: something was probably lost.
            self.flush_ack(&mut out);
            self.rx_ack_sequence = pktseq;
            self.rx_ack_count = 0;
            if send_ack {
                out.push(AckSend {
                    ackseq: self.rx_ack_sequence,
                    ack_count: 0,
                });
            }
        } else {
            // Old packet received out of order.
            self.flush_ack(&mut out);
            if send_ack {
                out.push(AckSend {
                    ackseq: pktseq,
                    ack_count: 0,
                });
            }
        }
        out
    }

    fn flush_ack(&mut self, out: &mut Vec<AckSend>) {
        if self.rx_unacked > 0 {
            self.rx_unacked = 0;
            out.push(AckSend {
                ackseq: self.rx_ack_sequence,
                ack_count: self.rx_ack_count,
            });
        }
        self.ack_timer.stop();
    }

    /// Drive the delayed-ack and retransmission timers.
    pub fn poll_timers(&mut self, now: Instant) -> TimerPoll {
        let mut poll = TimerPoll::default();

        if self.ack_timer.expired(now) {
            self.flush_ack(&mut poll.acks);
        }

        if self.retransmit_timer.expired(now) {
            self.stall_time += self.retransmit_timer.interval;
            let failed = self.stall_time >= LINK_DOWN_TIMEOUT;
            debug!(
                chan = self.local_channel,
                stalled_for = ?self.stall_time,
                failed,
                "retransmit timeout"
            );
            self.retransmit_timer.restart_backoff(now, RETRANSMIT_CAP);

            // Assume every in-flight data packet was dropped and let the
            // stream layer decide what to resend.
            let seqlim = self.tx_sequence;
            let mut seq = self.tx_event_sequence;
            while seq < seqlim {
                if self.clear_pipe(seq) {
                    poll.events.push(ChannelEvent::Missed {
                        txseq: seq,
                        npackets: 1,
                    });
                }
                seq += 1;
            }
            debug_assert_eq!(self.tx_inflight_count, 0);

            self.congestion.on_timeout();

            // Force at least one transmission regardless of the window.
            poll.events.push(ChannelEvent::ReadyTransmit);

            let new_status = if failed {
                LinkStatus::Down
            } else {
                LinkStatus::Stalled
            };
            if self.status != new_status {
                self.status = new_status;
                poll.events.push(ChannelEvent::StatusChanged(new_status));
            }
        }

        poll
    }

    /// Earliest instant at which `poll_timers` has work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.ack_timer.deadline, self.retransmit_timer.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Sign-extend the 24-bit difference between a wire sequence field and the
/// low 24 bits of a locally tracked 64-bit sequence.
fn seq_diff24(wire_low: u32, reference: PacketSeq) -> i32 {
    let d = wire_low.wrapping_sub(reference as u32) & 0x00ff_ffff;
    if d & 0x0080_0000 != 0 {
        (d | 0xff00_0000) as i32
    } else {
        d as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armor::NullArmor;
    use crate::congestion::FixedWindow;

    fn channel(now: Instant) -> Channel {
        let mut ch = Channel::new(
            1,
            1,
            Box::new(NullArmor),
            Box::new(FixedWindow(64)),
            now,
        );
        ch.start();
        ch
    }

    fn data_packet(len: usize) -> Vec<u8> {
        let mut p = vec![0u8; CHANNEL_HEADER_SIZE];
        p.extend(std::iter::repeat(0xab).take(len));
        p
    }

    #[test]
    fn sequence_sign_extension() {
        assert_eq!(seq_diff24(5, 3), 2);
        assert_eq!(seq_diff24(3, 5), -2);
        // Wrap across the 24-bit boundary.
        assert_eq!(seq_diff24(2, 0x00ff_fffe), 4);
        assert_eq!(seq_diff24(0x00ff_fffe, 0x0100_0002), -4);
    }

    #[test]
    fn ack_round_trip() {
        let now = Instant::now();
        let mut a = channel(now);
        let mut b = channel(now);

        let (seq, wire) = a.transmit_data(data_packet(10), now).unwrap();
        assert_eq!(seq, 1);

        let rx = b.receive(&wire, now).unwrap();
        assert_eq!(rx.pktseq, 1);

        let acks = b.acknowledge(rx.pktseq, true, now);
        // First data packet: delayed ack timer armed, nothing sent yet.
        assert!(acks.is_empty());
        let poll = b.poll_timers(now + ACK_DELAY);
        assert_eq!(poll.acks.len(), 1);
        let ack = poll.acks[0];
        assert_eq!(ack.ackseq, 1);

        let (_, ack_wire) = b
            .transmit_ack_packet(Vec::new(), ack.ackseq, ack.ack_count, now)
            .unwrap();
        let rx = a.receive(&ack_wire, now).unwrap();
        assert!(rx
            .events
            .iter()
            .any(|e| matches!(e, ChannelEvent::Acknowledged { txseq: 1, .. })));
    }

    #[test]
    fn duplicate_and_stale_packets_dropped() {
        let now = Instant::now();
        let mut a = channel(now);
        let mut b = channel(now);

        let (_, wire) = a.transmit_data(data_packet(4), now).unwrap();
        b.receive(&wire, now).unwrap();
        // Identical packet again: replay.
        assert!(matches!(
            b.receive(&wire, now),
            Err(ChannelError::PacketDropped)
        ));

        // Push the window far ahead, then replay: too old.
        let mut last = Vec::new();
        for _ in 0..40 {
            let (_, w) = a.transmit_data(data_packet(4), now).unwrap();
            last = w;
        }
        b.receive(&last, now).unwrap();
        assert!(matches!(
            b.receive(&wire, now),
            Err(ChannelError::PacketDropped)
        ));
    }

    #[test]
    fn out_of_order_within_window_accepted_once() {
        let now = Instant::now();
        let mut a = channel(now);
        let mut b = channel(now);

        let (_, w1) = a.transmit_data(data_packet(4), now).unwrap();
        let (_, w2) = a.transmit_data(data_packet(4), now).unwrap();

        b.receive(&w2, now).unwrap();
        b.receive(&w1, now).unwrap();
        assert!(matches!(
            b.receive(&w1, now),
            Err(ChannelError::PacketDropped)
        ));
    }

    #[test]
    fn miss_inferred_then_expired_once_in_order() {
        let now = Instant::now();
        let mut a = channel(now);
        let mut b = channel(now);

        // Transmit a run; deliver all but the first.
        let mut wires = Vec::new();
        for _ in 0..40 {
            let (_, w) = a.transmit_data(data_packet(4), now).unwrap();
            wires.push(w);
        }

        let mut missed_at = None;
        let mut expired_at = None;
        let mut expired_count = 0;
        for (i, w) in wires.iter().enumerate().skip(1) {
            let rx = b.receive(w, now).unwrap();
            for ack in b.acknowledge(rx.pktseq, true, now) {
                let (_, aw) = b
                    .transmit_ack_packet(Vec::new(), ack.ackseq, ack.ack_count, now)
                    .unwrap();
                let res = a.receive(&aw, now).unwrap();
                for ev in res.events {
                    match ev {
                        ChannelEvent::Missed { txseq: 1, .. } => {
                            assert!(expired_at.is_none(), "missed after expire");
                            missed_at.get_or_insert(i);
                        }
                        ChannelEvent::Expired { txseq: 1, .. } => {
                            expired_at.get_or_insert(i);
                            expired_count += 1;
                        }
                        _ => {}
                    }
                }
            }
        }
        assert!(missed_at.is_some(), "loss never inferred");
        assert!(expired_at.is_some(), "record never expired");
        assert!(missed_at.unwrap() <= expired_at.unwrap());
        assert_eq!(expired_count, 1);
    }

    #[test]
    fn retransmit_timeout_marks_all_inflight_missed() {
        let now = Instant::now();
        let mut a = channel(now);

        for _ in 0..3 {
            a.transmit_data(data_packet(4), now).unwrap();
        }
        let deadline = a.next_deadline().expect("retransmit timer armed");
        let poll = a.poll_timers(deadline);
        let missed: Vec<_> = poll
            .events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Missed { .. }))
            .collect();
        assert_eq!(missed.len(), 3);
        assert!(poll
            .events
            .iter()
            .any(|e| matches!(e, ChannelEvent::ReadyTransmit)));
        assert!(poll
            .events
            .iter()
            .any(|e| matches!(e, ChannelEvent::StatusChanged(LinkStatus::Stalled))));
    }

    #[test]
    fn ack_for_untransmitted_packet_dropped() {
        let now = Instant::now();
        let mut a = channel(now);
        let mut b = channel(now);

        a.transmit_data(data_packet(4), now).unwrap();
        // b acknowledges a sequence it never could have seen.
        let (_, wire) = b.transmit_ack_packet(Vec::new(), 7, 0, now).unwrap();
        assert!(matches!(
            a.receive(&wire, now),
            Err(ChannelError::PacketDropped)
        ));
    }

    #[test]
    fn window_exhaustion_latches_cwnd_limited() {
        let now = Instant::now();
        let mut a = Channel::new(1, 1, Box::new(NullArmor), Box::new(FixedWindow(2)), now);
        a.start();

        assert_eq!(a.may_transmit(), 2);
        a.transmit_data(data_packet(4), now).unwrap();
        a.transmit_data(data_packet(4), now).unwrap();
        assert_eq!(a.may_transmit(), 0);
        assert!(a.is_cwnd_limited());
    }

    #[test]
    fn immediate_ack_on_discontiguous_receive() {
        let now = Instant::now();
        let mut a = channel(now);
        let mut b = channel(now);

        let (_, w1) = a.transmit_data(data_packet(4), now).unwrap();
        let (_, _w2) = a.transmit_data(data_packet(4), now).unwrap();
        let (_, w3) = a.transmit_data(data_packet(4), now).unwrap();

        let rx = b.receive(&w1, now).unwrap();
        assert!(b.acknowledge(rx.pktseq, true, now).is_empty());

        // Packet 2 lost; 3 arrives discontiguous: ack immediately.
        let rx = b.receive(&w3, now).unwrap();
        let acks = b.acknowledge(rx.pktseq, true, now);
        assert!(!acks.is_empty());
        assert_eq!(acks.last().unwrap().ackseq, 3);
    }
}
