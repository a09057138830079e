//! Stream attachment slots.
//!
//! A stream holds up to two transmit and two receive attachment slots so
//! it can be mid-attach on a new channel while the old one drains. At any
//! instant at most one transmit slot is current; the other is idle or
//! attaching. Slots are indices into fixed arrays owned by the stream,
//! never pointers.

use crate::channel::PacketSeq;

/// Number of attachment slots per direction.
pub const MAX_ATTACHMENTS: usize = 2;

/// Transmit-side attachment state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxAttachState {
    /// Slot free.
    #[default]
    Unused,
    /// LSID allocated, nothing sent yet.
    Attaching,
    /// Attach (or Init/Reply) transmitted. `acked` turns true when the
    /// peer acknowledges the packet that bound the LSID; bare attaches
    /// carry no data until then.
    Active {
        /// The peer acknowledged the binding.
        acked: bool,
    },
}

/// One transmit attachment slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxAttachment {
    /// Slot state.
    pub state: TxAttachState,
    /// LSID in our transmit namespace, valid unless `Unused`.
    pub sid: u16,
}

impl TxAttachment {
    /// Whether the slot is occupied.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.state != TxAttachState::Unused
    }

    /// Whether data may flow (binding acknowledged).
    #[must_use]
    pub fn is_acked(&self) -> bool {
        matches!(self.state, TxAttachState::Active { acked: true })
    }

    /// Claim the slot with a freshly allocated LSID.
    pub fn set_attaching(&mut self, sid: u16) {
        self.state = TxAttachState::Attaching;
        self.sid = sid;
    }

    /// Record that the binding packet went out.
    pub fn set_active(&mut self, acked: bool) {
        self.state = TxAttachState::Active { acked };
    }

    /// Release the slot.
    pub fn clear(&mut self) {
        self.state = TxAttachState::Unused;
        self.sid = 0;
    }
}

/// One receive attachment slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxAttachment {
    active: bool,
    /// LSID in the peer's transmit namespace.
    pub sid: u16,
    /// Packet sequence at which the attach became valid; data packets
    /// below this are stale replays from a previous binding.
    pub sid_seq: PacketSeq,
}

impl RxAttachment {
    /// Whether the slot is bound.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Bind the slot. A re-bind with the same LSID keeps the smaller
    /// `sid_seq`, making duplicate attaches idempotent.
    pub fn set_active(&mut self, sid: u16, sid_seq: PacketSeq) {
        if self.active && self.sid == sid {
            self.sid_seq = self.sid_seq.min(sid_seq);
        } else {
            self.active = true;
            self.sid = sid;
            self.sid_seq = sid_seq;
        }
    }

    /// Release the slot.
    pub fn clear(&mut self) {
        self.active = false;
        self.sid = 0;
        self.sid_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_attach_keeps_min_sid_seq() {
        let mut slot = RxAttachment::default();
        slot.set_active(5, 100);
        slot.set_active(5, 40);
        assert_eq!(slot.sid_seq, 40);
        slot.set_active(5, 200);
        assert_eq!(slot.sid_seq, 40);
    }

    #[test]
    fn rebind_to_new_sid_resets_sid_seq() {
        let mut slot = RxAttachment::default();
        slot.set_active(5, 100);
        slot.set_active(6, 200);
        assert_eq!(slot.sid_seq, 200);
    }
}
