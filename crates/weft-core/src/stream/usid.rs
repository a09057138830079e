//! Globally unique stream identifiers.
//!
//! A USID names a stream independently of any channel, so a stream can
//! detach from a failing channel and reattach on a new one. It pairs a
//! 32-bit counter (the stream's first transmit LSID) with the 8-byte
//! half-channel id of the direction that created it.
//!
//! On the wire (inside Attach packets) a USID is a two-element
//! MessagePack array `[counter, half_channel_id]`.

use rmpv::Value;

use crate::error::FrameError;

/// Globally unique stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueStreamId {
    /// Counter within the creating half-channel; the stream's first LSID.
    pub counter: u32,
    /// Tag of the half-channel the stream was created on.
    pub half_channel_id: [u8; 8],
}

impl UniqueStreamId {
    /// Construct from parts.
    #[must_use]
    pub fn new(counter: u32, half_channel_id: [u8; 8]) -> Self {
        Self {
            counter,
            half_channel_id,
        }
    }

    /// Encode as an rmpv value for the Attach payload.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Integer(self.counter.into()),
            Value::Binary(self.half_channel_id.to_vec()),
        ])
    }

    /// Decode from an rmpv value.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MalformedAttach`] on any shape mismatch.
    pub fn from_value(value: &Value) -> Result<Self, FrameError> {
        let items = value.as_array().ok_or(FrameError::MalformedAttach)?;
        if items.len() != 2 {
            return Err(FrameError::MalformedAttach);
        }
        let counter = items[0]
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(FrameError::MalformedAttach)?;
        let bytes = items[1].as_slice().ok_or(FrameError::MalformedAttach)?;
        let half_channel_id: [u8; 8] =
            bytes.try_into().map_err(|_| FrameError::MalformedAttach)?;
        Ok(Self {
            counter,
            half_channel_id,
        })
    }
}

impl std::fmt::Display for UniqueStreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}",
            self.counter,
            self.half_channel_id
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_roundtrip() {
        let usid = UniqueStreamId::new(42, *b"halfchan");
        let decoded = UniqueStreamId::from_value(&usid.to_value()).unwrap();
        assert_eq!(usid, decoded);
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(UniqueStreamId::from_value(&Value::Nil).is_err());
        assert!(UniqueStreamId::from_value(&Value::Array(vec![Value::from(1)])).is_err());
        assert!(UniqueStreamId::from_value(&Value::Array(vec![
            Value::from(1),
            Value::Binary(vec![0; 7]),
        ]))
        .is_err());
    }
}
