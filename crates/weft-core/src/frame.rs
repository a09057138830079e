//! Stream frame encoding and decoding.
//!
//! Every channel packet carries one stream frame after the 8-byte channel
//! header. All frames begin with a 4-byte stream header: 16-bit LSID,
//! a type/subtype byte (type in the high nibble, subtype flags in the low
//! nibble), and the 8-bit receive-window byte. Multi-byte fields are
//! big-endian.

use crate::error::FrameError;
use crate::stream::usid::UniqueStreamId;

/// Fixed stream header size.
pub const STREAM_HEADER_SIZE: usize = 4;

/// Frame types, encoded in the high nibble of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// First data packet for a new stream; attaches it implicitly.
    Init = 0x1,
    /// First data packet replying on a stream the peer created.
    Reply = 0x2,
    /// Subsequent reliable data.
    Data = 0x3,
    /// Unreliable message.
    Datagram = 0x4,
    /// Stand-alone acknowledgment with window update.
    Ack = 0x5,
    /// Stream termination.
    Reset = 0x6,
    /// Attach a stream by USID to a slot on this channel.
    Attach = 0x7,
    /// Release an attachment slot.
    Detach = 0x8,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(Self::Init),
            0x2 => Ok(Self::Reply),
            0x3 => Ok(Self::Data),
            0x4 => Ok(Self::Datagram),
            0x5 => Ok(Self::Ack),
            0x6 => Ok(Self::Reset),
            0x7 => Ok(Self::Attach),
            0x8 => Ok(Self::Detach),
            other => Err(FrameError::InvalidType(other)),
        }
    }
}

/// Subtype flag on Init/Reply/Data: final segment, close the write side.
pub const FLAG_DATA_CLOSE: u8 = 0x1;
/// Subtype flag on Init/Reply/Data: record boundary, push to the reader.
pub const FLAG_DATA_PUSH: u8 = 0x4;
/// Subtype flag on Reset: the LSID is in the sender's receive space.
pub const FLAG_RESET_REMOTE: u8 = 0x1;
/// Subtype flag on Attach: this is a stream-initiating attach.
pub const FLAG_ATTACH_INIT: u8 = 0x8;
/// Subtype mask on Attach/Detach selecting the attachment slot.
pub const FLAG_SLOT_MASK: u8 = 0x1;

/// A decoded stream frame. Owned, so it can sit in retransmission queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Create-and-send: parent LSID, fresh LSID, 16-bit byte seq, payload.
    Init {
        /// Parent stream's LSID in the sender's transmit space.
        parent_sid: u16,
        /// The new stream's LSID.
        new_sid: u16,
        /// Low 16 bits of the starting byte sequence.
        byte_seq: u16,
        /// Receive window byte.
        window: u8,
        /// Close/push flags.
        flags: u8,
        /// First payload segment.
        payload: Vec<u8>,
    },
    /// Reply-and-send on a peer-created stream.
    Reply {
        /// The LSID the peer used to create the stream (our receive space).
        remote_sid: u16,
        /// Our fresh LSID for the reply direction.
        new_sid: u16,
        /// Low 16 bits of the starting byte sequence.
        byte_seq: u16,
        /// Receive window byte.
        window: u8,
        /// Close/push flags.
        flags: u8,
        /// First payload segment.
        payload: Vec<u8>,
    },
    /// Reliable data segment.
    Data {
        /// Sender's transmit LSID.
        sid: u16,
        /// Byte sequence of the segment start.
        byte_seq: u32,
        /// Receive window byte.
        window: u8,
        /// Close/push flags.
        flags: u8,
        /// Segment payload.
        payload: Vec<u8>,
    },
    /// Unreliable record.
    Datagram {
        /// Sender's transmit LSID.
        sid: u16,
        /// Receive window byte.
        window: u8,
        /// Flags (close permitted).
        flags: u8,
        /// Whole record.
        payload: Vec<u8>,
    },
    /// Bare acknowledgment carrying a window update.
    Ack {
        /// LSID whose window is being advertised (receiver's choice).
        sid: u16,
        /// Receive window byte.
        window: u8,
    },
    /// Terminate a stream.
    Reset {
        /// LSID of the stream being reset.
        sid: u16,
        /// [`FLAG_RESET_REMOTE`] when `sid` is in the sender's rx space.
        flags: u8,
    },
    /// Attach a stream to this channel by USID.
    Attach {
        /// The LSID being bound.
        sid: u16,
        /// Attachment slot (0 or 1).
        slot: u8,
        /// True when this attach initiates the stream.
        init: bool,
        /// Receive window byte.
        window: u8,
        /// The stream's USID.
        usid: UniqueStreamId,
        /// Parent USID, present when `init`.
        parent_usid: Option<UniqueStreamId>,
    },
    /// Release an attachment slot.
    Detach {
        /// The LSID being released.
        sid: u16,
        /// Attachment slot (0 or 1).
        slot: u8,
    },
}

impl Frame {
    /// The frame's type code.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Init { .. } => FrameType::Init,
            Frame::Reply { .. } => FrameType::Reply,
            Frame::Data { .. } => FrameType::Data,
            Frame::Datagram { .. } => FrameType::Datagram,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Reset { .. } => FrameType::Reset,
            Frame::Attach { .. } => FrameType::Attach,
            Frame::Detach { .. } => FrameType::Detach,
        }
    }

    /// True for frames that should elicit an acknowledgment (everything
    /// except a bare Ack).
    #[must_use]
    pub fn wants_ack(&self) -> bool {
        !matches!(self, Frame::Ack { .. })
    }

    /// Append the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Init {
                parent_sid,
                new_sid,
                byte_seq,
                window,
                flags,
                payload,
            } => {
                put_header(buf, *parent_sid, FrameType::Init, *flags, *window);
                buf.extend_from_slice(&new_sid.to_be_bytes());
                buf.extend_from_slice(&byte_seq.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Frame::Reply {
                remote_sid,
                new_sid,
                byte_seq,
                window,
                flags,
                payload,
            } => {
                put_header(buf, *remote_sid, FrameType::Reply, *flags, *window);
                buf.extend_from_slice(&new_sid.to_be_bytes());
                buf.extend_from_slice(&byte_seq.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Frame::Data {
                sid,
                byte_seq,
                window,
                flags,
                payload,
            } => {
                put_header(buf, *sid, FrameType::Data, *flags, *window);
                buf.extend_from_slice(&byte_seq.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Frame::Datagram {
                sid,
                window,
                flags,
                payload,
            } => {
                put_header(buf, *sid, FrameType::Datagram, *flags, *window);
                buf.extend_from_slice(payload);
            }
            Frame::Ack { sid, window } => {
                put_header(buf, *sid, FrameType::Ack, 0, *window);
            }
            Frame::Reset { sid, flags } => {
                put_header(buf, *sid, FrameType::Reset, *flags, 0);
            }
            Frame::Attach {
                sid,
                slot,
                init,
                window,
                usid,
                parent_usid,
            } => {
                let mut flags = slot & FLAG_SLOT_MASK;
                if *init {
                    flags |= FLAG_ATTACH_INIT;
                }
                put_header(buf, *sid, FrameType::Attach, flags, *window);
                let mut ids = vec![usid.to_value()];
                if let Some(parent) = parent_usid {
                    ids.push(parent.to_value());
                }
                rmpv::encode::write_value(buf, &rmpv::Value::Array(ids))
                    .expect("msgpack encoding to Vec never fails");
            }
            Frame::Detach { sid, slot } => {
                put_header(buf, *sid, FrameType::Detach, slot & FLAG_SLOT_MASK, 0);
            }
        }
    }

    /// Decode one frame from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] for runt frames, unknown types, or a
    /// malformed attach payload.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < STREAM_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: STREAM_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let sid = u16::from_be_bytes([bytes[0], bytes[1]]);
        let type_byte = bytes[2];
        let window = bytes[3];
        let ftype = FrameType::try_from(type_byte >> 4)?;
        let flags = type_byte & 0x0f;
        let rest = &bytes[STREAM_HEADER_SIZE..];

        match ftype {
            FrameType::Init | FrameType::Reply => {
                if rest.len() < 4 {
                    return Err(FrameError::TooShort {
                        expected: STREAM_HEADER_SIZE + 4,
                        actual: bytes.len(),
                    });
                }
                let new_sid = u16::from_be_bytes([rest[0], rest[1]]);
                let byte_seq = u16::from_be_bytes([rest[2], rest[3]]);
                let payload = rest[4..].to_vec();
                Ok(if ftype == FrameType::Init {
                    Frame::Init {
                        parent_sid: sid,
                        new_sid,
                        byte_seq,
                        window,
                        flags,
                        payload,
                    }
                } else {
                    Frame::Reply {
                        remote_sid: sid,
                        new_sid,
                        byte_seq,
                        window,
                        flags,
                        payload,
                    }
                })
            }
            FrameType::Data => {
                if rest.len() < 4 {
                    return Err(FrameError::TooShort {
                        expected: STREAM_HEADER_SIZE + 4,
                        actual: bytes.len(),
                    });
                }
                let byte_seq = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                Ok(Frame::Data {
                    sid,
                    byte_seq,
                    window,
                    flags,
                    payload: rest[4..].to_vec(),
                })
            }
            FrameType::Datagram => Ok(Frame::Datagram {
                sid,
                window,
                flags,
                payload: rest.to_vec(),
            }),
            FrameType::Ack => Ok(Frame::Ack { sid, window }),
            FrameType::Reset => Ok(Frame::Reset { sid, flags }),
            FrameType::Attach => {
                let mut cursor = rest;
                let value = rmpv::decode::read_value(&mut cursor)
                    .map_err(|_| FrameError::MalformedAttach)?;
                let ids = value.as_array().ok_or(FrameError::MalformedAttach)?;
                if ids.is_empty() || ids.len() > 2 {
                    return Err(FrameError::MalformedAttach);
                }
                let usid = UniqueStreamId::from_value(&ids[0])?;
                let parent_usid = match ids.get(1) {
                    Some(v) => Some(UniqueStreamId::from_value(v)?),
                    None => None,
                };
                Ok(Frame::Attach {
                    sid,
                    slot: flags & FLAG_SLOT_MASK,
                    init: flags & FLAG_ATTACH_INIT != 0,
                    window,
                    usid,
                    parent_usid,
                })
            }
            FrameType::Detach => Ok(Frame::Detach {
                sid,
                slot: flags & FLAG_SLOT_MASK,
            }),
        }
    }
}

fn put_header(buf: &mut Vec<u8>, sid: u16, ftype: FrameType, flags: u8, window: u8) {
    buf.extend_from_slice(&sid.to_be_bytes());
    buf.push((ftype as u8) << 4 | (flags & 0x0f));
    buf.push(window);
}

/// Encode an advertised receive window as the 8-bit exponent-mantissa
/// window byte: low 5 bits exponent `e`, high 3 bits mantissa `m`,
/// window = `(8 + m) << e`. Rounds down.
#[must_use]
pub fn encode_window(window: u32) -> u8 {
    if window < 8 {
        return 0;
    }
    let mut e = 0u8;
    let mut w = window;
    while w >= 16 && e < 31 {
        w >>= 1;
        e += 1;
    }
    // 8 <= w < 16 now; mantissa is the low 3 bits above the implicit 8.
    let m = (w - 8) as u8;
    (m << 5) | e
}

/// Decode a window byte back to a byte count.
#[must_use]
pub fn decode_window(byte: u8) -> u32 {
    let e = u32::from(byte & 0x1f);
    let m = u32::from(byte >> 5);
    (8 + m).checked_shl(e).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_roundtrip() {
        let frame = Frame::Data {
            sid: 7,
            byte_seq: 0xdead_beef,
            window: 0x1a,
            flags: FLAG_DATA_CLOSE,
            payload: vec![1, 2, 3],
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(Frame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn init_frame_roundtrip() {
        let frame = Frame::Init {
            parent_sid: 0,
            new_sid: 1,
            byte_seq: 100,
            window: 0,
            flags: FLAG_DATA_PUSH,
            payload: b"first".to_vec(),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(Frame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn attach_frame_roundtrip() {
        let frame = Frame::Attach {
            sid: 3,
            slot: 1,
            init: true,
            window: 0x40,
            usid: UniqueStreamId::new(3, *b"abcdefgh"),
            parent_usid: Some(UniqueStreamId::new(0, *b"abcdefgh")),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(Frame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn runt_and_bad_type_rejected() {
        assert!(Frame::decode(&[0, 0, 0]).is_err());
        // Type nibble 0x0 is invalid.
        assert!(Frame::decode(&[0, 1, 0x00, 0]).is_err());
        assert!(Frame::decode(&[0, 1, 0x90, 0]).is_err());
    }

    #[test]
    fn window_byte_roundtrips_within_precision() {
        for &w in &[8u32, 64, 1500, 65536, 1 << 20, 0x0600_0000] {
            let decoded = decode_window(encode_window(w));
            assert!(decoded <= w);
            assert!(decoded * 2 > w, "window {w} decoded to {decoded}");
        }
    }

    #[test]
    fn tiny_window_encodes_to_floor() {
        assert_eq!(decode_window(encode_window(0)), 8);
    }
}
