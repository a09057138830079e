//! Streams: reliable byte substreams and unreliable datagram substreams
//! multiplexed over channels.

pub mod attach;
pub mod base;
pub mod usid;

pub use base::{BaseStream, StreamState, TxSegment};
pub use usid::UniqueStreamId;

use std::collections::HashMap;

/// Process-local handle to one stream within one peer's stream set.
pub type StreamKey = u64;

/// Events surfaced from the stream layer to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A channel to this peer came up.
    ChannelConnected,
    /// The peer's channel status changed (stalled, down).
    LinkStatusChanged(crate::channel::LinkStatus),
    /// A peer-initiated substream arrived; accept it from the parent.
    NewSubstream {
        /// The listening parent.
        parent: StreamKey,
    },
    /// Reliable bytes became readable.
    DataAvailable {
        /// The readable stream.
        stream: StreamKey,
    },
    /// A datagram became readable.
    DatagramAvailable {
        /// The readable stream.
        stream: StreamKey,
    },
    /// The stream's first attachment was acknowledged.
    Attached {
        /// The attached stream.
        stream: StreamKey,
    },
    /// The peer reset the stream.
    Reset {
        /// The reset stream.
        stream: StreamKey,
    },
    /// The read side reached end of stream.
    EndOfStream {
        /// The finished stream.
        stream: StreamKey,
    },
}

/// A peer's streams, indexed by local key and by USID.
#[derive(Default)]
pub struct StreamSet {
    streams: HashMap<StreamKey, BaseStream>,
    by_usid: HashMap<UniqueStreamId, StreamKey>,
    next_key: StreamKey,
}

impl StreamSet {
    /// Insert a stream, returning its key.
    pub fn insert(&mut self, stream: BaseStream) -> StreamKey {
        let key = self.next_key;
        self.next_key += 1;
        if let Some(usid) = stream.usid {
            self.by_usid.insert(usid, key);
        }
        self.streams.insert(key, stream);
        key
    }

    /// Borrow a stream.
    #[must_use]
    pub fn get(&self, key: StreamKey) -> Option<&BaseStream> {
        self.streams.get(&key)
    }

    /// Borrow a stream mutably.
    pub fn get_mut(&mut self, key: StreamKey) -> Option<&mut BaseStream> {
        self.streams.get_mut(&key)
    }

    /// Look up by USID.
    #[must_use]
    pub fn by_usid(&self, usid: &UniqueStreamId) -> Option<StreamKey> {
        self.by_usid.get(usid).copied()
    }

    /// Record a USID assignment.
    pub fn index_usid(&mut self, usid: UniqueStreamId, key: StreamKey) {
        self.by_usid.insert(usid, key);
    }

    /// Remove a stream and its USID index entry.
    pub fn remove(&mut self, key: StreamKey) -> Option<BaseStream> {
        let stream = self.streams.remove(&key)?;
        if let Some(usid) = stream.usid {
            self.by_usid.remove(&usid);
        }
        Some(stream)
    }

    /// Iterate over keys (snapshot).
    #[must_use]
    pub fn keys(&self) -> Vec<StreamKey> {
        self.streams.keys().copied().collect()
    }

    /// Number of live streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
