//! Wire frame codec
//!
//! Every datagram carries a fixed 16-byte header:
//!
//! ```text
//! [Magic: 4][Version: 2][Type: 1][Reserved: 1][Sequence: 4][MsgLen: 4][Payload...]
//! ```
//!
//! All integers are big-endian. `MsgLen` carries the payload length for
//! `Message` frames and is zero for every other type. The reserved byte
//! is written as zero and ignored on receive.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetworkError, NetworkResult};

/// Magic number identifying PeerBridge datagrams
pub const MAGIC: u32 = 0x1234_5678;

/// Wire protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_LEN: usize = 16;

/// Largest datagram we will hand to the socket (UDP/IPv4 maximum)
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Largest payload that fits a single frame
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_LEN;

/// Frame type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// NAT pinhole opener, doubles as keep-alive
    HolePunch = 0x01,

    /// Explicit liveness probe
    Heartbeat = 0x02,

    /// Bridged IP packet
    Message = 0x03,

    /// Acknowledgement echoing a Message sequence
    Ack = 0x04,

    /// Graceful teardown notification
    Disconnect = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, NetworkError> {
        match value {
            0x01 => Ok(Self::HolePunch),
            0x02 => Ok(Self::Heartbeat),
            0x03 => Ok(Self::Message),
            0x04 => Ok(Self::Ack),
            0x05 => Ok(Self::Disconnect),
            _ => Err(NetworkError::InvalidFrame(format!(
                "Unknown frame type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// A decoded wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,

    /// Per-sender sequence number; for Ack, the acknowledged sequence
    pub sequence: u32,

    /// Payload (non-empty only for Message frames)
    pub payload: Bytes,
}

impl Frame {
    /// Create a control frame without payload
    pub fn control(frame_type: FrameType, sequence: u32) -> Self {
        Self {
            frame_type,
            sequence,
            payload: Bytes::new(),
        }
    }

    /// Create a message frame
    pub fn message(sequence: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type: FrameType::Message,
            sequence,
            payload: payload.into(),
        }
    }

    /// Serialize into header + payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(0); // reserved
        buf.put_u32(self.sequence);
        if self.frame_type == FrameType::Message {
            buf.put_u32(self.payload.len() as u32);
            buf.put_slice(&self.payload);
        } else {
            buf.put_u32(0);
        }
        buf.freeze()
    }

    /// Parse and validate a received datagram.
    ///
    /// Any validation failure is a non-fatal drop for the caller; no
    /// state is touched here.
    pub fn decode(mut bytes: Bytes) -> NetworkResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(NetworkError::InvalidFrame(format!(
                "Datagram too short: {} bytes",
                bytes.len()
            )));
        }

        let magic = bytes.get_u32();
        if magic != MAGIC {
            return Err(NetworkError::InvalidFrame(format!(
                "Bad magic number: 0x{:08x}",
                magic
            )));
        }

        let version = bytes.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(NetworkError::InvalidFrame(format!(
                "Unsupported protocol version: {}",
                version
            )));
        }

        let frame_type = FrameType::try_from(bytes.get_u8())?;
        bytes.advance(1); // reserved, ignored
        let sequence = bytes.get_u32();
        let msg_len = bytes.get_u32() as usize;

        let payload = if frame_type == FrameType::Message {
            if msg_len > bytes.len() {
                return Err(NetworkError::InvalidFrame(format!(
                    "Message length {} exceeds datagram payload {}",
                    msg_len,
                    bytes.len()
                )));
            }
            bytes.slice(..msg_len)
        } else {
            Bytes::new()
        };

        Ok(Self {
            frame_type,
            sequence,
            payload,
        })
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        if self.frame_type == FrameType::Message {
            HEADER_LEN + self.payload.len()
        } else {
            HEADER_LEN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_frame_layout() {
        let frame = Frame::message(7, vec![0xAA, 0xBB]);
        let bytes = frame.encode();

        assert_eq!(bytes.len(), 18);
        assert_eq!(
            &bytes[..],
            &[
                0x12, 0x34, 0x56, 0x78, // magic
                0x00, 0x01, // version
                0x03, // type = Message
                0x00, // reserved
                0x00, 0x00, 0x00, 0x07, // sequence
                0x00, 0x00, 0x00, 0x02, // msg_len
                0xAA, 0xBB,
            ]
        );

        let decoded = Frame::decode(bytes).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Message);
        assert_eq!(decoded.sequence, 7);
        assert_eq!(&decoded.payload[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn roundtrip_all_types() {
        let frames = [
            Frame::control(FrameType::HolePunch, 0),
            Frame::control(FrameType::Heartbeat, 1),
            Frame::message(2, vec![1, 2, 3, 4, 5]),
            Frame::control(FrameType::Ack, 2),
            Frame::control(FrameType::Disconnect, 3),
        ];

        for frame in frames {
            let decoded = Frame::decode(frame.encode()).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = BytesMut::zeroed(16);
        bytes[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(Frame::decode(bytes.freeze()).is_err());
    }

    #[test]
    fn rejects_bad_version() {
        let frame = Frame::control(FrameType::Heartbeat, 9);
        let mut bytes = BytesMut::from(&frame.encode()[..]);
        bytes[5] = 2;
        assert!(Frame::decode(bytes.freeze()).is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let frame = Frame::control(FrameType::Heartbeat, 9);
        let mut bytes = BytesMut::from(&frame.encode()[..]);
        bytes[6] = 0x7F;
        assert!(Frame::decode(bytes.freeze()).is_err());
    }

    #[test]
    fn rejects_short_datagram() {
        let bytes = Bytes::from_static(&[0x12, 0x34, 0x56]);
        assert!(Frame::decode(bytes).is_err());
    }

    #[test]
    fn rejects_overlong_msg_len() {
        let frame = Frame::message(1, vec![0u8; 4]);
        let mut bytes = BytesMut::from(&frame.encode()[..]);
        // Claim more payload than the datagram carries
        bytes[12..16].copy_from_slice(&100u32.to_be_bytes());
        assert!(Frame::decode(bytes.freeze()).is_err());
    }

    #[test]
    fn reserved_byte_is_ignored() {
        let frame = Frame::message(42, vec![0x01]);
        let mut bytes = BytesMut::from(&frame.encode()[..]);
        bytes[7] = 0xFF;
        let decoded = Frame::decode(bytes.freeze()).unwrap();
        assert_eq!(decoded.sequence, 42);
        assert_eq!(&decoded.payload[..], &[0x01]);
    }
}
