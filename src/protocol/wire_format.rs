//! Wire format encoding and decoding.
//!
//! Implements the 8-byte header format:
//! ```text
//! ┌───────┬───────────┬───────────┬─────────────┬────────────┐
//! │ Kind  │ KindFlags │ Stream ID │ Sequence ID │ Length     │
//! │ 1 byte│ 1 byte    │ 2 bytes   │ 2 bytes     │ 2 bytes    │
//! │       │           │ uint16 LE │ uint16 LE   │ uint16 LE  │
//! └───────┴───────────┴───────────┴─────────────┴────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian.

use crate::error::{Result, WiremuxError};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Maximum payload bytes per frame (16-bit length field).
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Stream id reserved for connection-level control frames (ping, close).
pub const CONTROL_STREAM_ID: u16 = 0;

/// Frame kinds.
///
/// The numeric assignment is part of the wire format and must not change
/// within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Begin a logical call; payload is the UTF-8 method full-name.
    NewStream = 1,
    /// Abort a stream; no payload required.
    Cancel = 2,
    /// Server rejection of a `NewStream` whose method name is unbound.
    MethodNotFound = 3,
    /// Terminal status for a stream; implies end of the sender's half.
    Trailer = 4,
    /// Message bytes (possibly one chunk of a larger message).
    Payload = 5,
    /// Connection keep-alive probe (stream id 0).
    Ping = 6,
    /// Connection termination handshake (stream id 0).
    Close = 7,
}

impl FrameKind {
    /// Try to convert from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::NewStream),
            2 => Some(Self::Cancel),
            3 => Some(Self::MethodNotFound),
            4 => Some(Self::Trailer),
            5 => Some(Self::Payload),
            6 => Some(Self::Ping),
            7 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Kind-flag bits carried in byte 1 of the header.
pub mod flags {
    /// Final frame of one logical message.
    pub const END_ITEM: u8 = 0b0000_0001;
    /// Final message of the sender's half of the stream.
    pub const END_ALL_ITEMS: u8 = 0b0000_0010;
    /// Echo of a control frame (ping/close acknowledgement).
    pub const IS_RESPONSE: u8 = 0b0000_0100;
    /// Originator role marker: set on every frame sent by the server side.
    pub const FROM_SERVER: u8 = 0b0000_1000;

    /// Reserved bits mask (bits 4-7).
    pub const RESERVED_MASK: u8 = 0b1111_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame kind.
    pub kind: FrameKind,
    /// Kind-specific flags (see the `flags` module).
    pub kind_flags: u8,
    /// Logical stream id; 0 is reserved for connection control.
    pub stream_id: u16,
    /// Per-stream monotonic frame counter (wraps).
    pub sequence_id: u16,
    /// Payload length in bytes.
    pub payload_length: u16,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: FrameKind, kind_flags: u8, stream_id: u16, sequence_id: u16, payload_length: u16) -> Self {
        Self {
            kind,
            kind_flags,
            stream_id,
            sequence_id,
            payload_length,
        }
    }

    /// Encode the header to bytes (Little Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.kind as u8;
        buf[1] = self.kind_flags;
        buf[2..4].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.sequence_id.to_le_bytes());
        buf[6..8].copy_from_slice(&self.payload_length.to_le_bytes());
    }

    /// Decode a header from bytes (Little Endian).
    ///
    /// Returns an error for short buffers or unknown frame kinds; an
    /// unknown kind is a structural protocol violation because the decoder
    /// cannot know how to treat the frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(WiremuxError::Protocol(format!(
                "header truncated: {} of {} bytes",
                buf.len(),
                HEADER_SIZE
            )));
        }
        let kind = FrameKind::from_u8(buf[0])
            .ok_or_else(|| WiremuxError::Protocol(format!("unknown frame kind {:#04x}", buf[0])))?;
        Ok(Self {
            kind,
            kind_flags: buf[1],
            stream_id: u16::from_le_bytes([buf[2], buf[3]]),
            sequence_id: u16::from_le_bytes([buf[4], buf[5]]),
            payload_length: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    /// Validate flag usage for protocol compliance.
    pub fn validate(&self) -> Result<()> {
        if self.kind_flags & flags::RESERVED_MASK != 0 {
            return Err(WiremuxError::Protocol(
                "reserved flag bits must be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Check if this frame ends one logical message.
    #[inline]
    pub fn is_end_item(&self) -> bool {
        flags::has_flag(self.kind_flags, flags::END_ITEM)
    }

    /// Check if this frame ends the sender's half of the stream.
    #[inline]
    pub fn is_end_all_items(&self) -> bool {
        flags::has_flag(self.kind_flags, flags::END_ALL_ITEMS)
    }

    /// Check if this is a control-frame echo.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.kind_flags, flags::IS_RESPONSE)
    }

    /// Check if the sender was the server side of its connection.
    #[inline]
    pub fn is_from_server(&self) -> bool {
        flags::has_flag(self.kind_flags, flags::FROM_SERVER)
    }

    /// Check if this is a connection-level control frame.
    #[inline]
    pub fn is_control(&self) -> bool {
        self.stream_id == CONTROL_STREAM_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(FrameKind::Payload, flags::END_ITEM, 42, 7, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = Header::new(FrameKind::Payload, 0x03, 0x0102, 0x0304, 0x0506);
        let bytes = header.encode();

        assert_eq!(bytes[0], 5); // kind
        assert_eq!(bytes[1], 0x03); // flags

        // stream_id: 0x0102 in LE
        assert_eq!(bytes[2], 0x02);
        assert_eq!(bytes[3], 0x01);

        // sequence_id: 0x0304 in LE
        assert_eq!(bytes[4], 0x04);
        assert_eq!(bytes[5], 0x03);

        // payload_length: 0x0506 in LE
        assert_eq!(bytes[6], 0x06);
        assert_eq!(bytes[7], 0x05);
    }

    #[test]
    fn test_header_size_is_exactly_8() {
        assert_eq!(HEADER_SIZE, 8);
        let header = Header::new(FrameKind::Ping, 0, 0, 0, 0);
        assert_eq!(header.encode().len(), 8);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 7]; // One byte short
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_unknown_kind_rejected() {
        let mut buf = Header::new(FrameKind::Payload, 0, 1, 0, 0).encode();
        buf[0] = 0xEE;
        let err = Header::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("unknown frame kind"));
    }

    #[test]
    fn test_validate_reserved_bits_must_be_zero() {
        let header = Header::new(FrameKind::Payload, 0b1000_0000, 1, 0, 0);
        let result = header.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("reserved flag bits"));
    }

    #[test]
    fn test_frame_kind_roundtrip() {
        for raw in 1..=7u8 {
            let kind = FrameKind::from_u8(raw).unwrap();
            assert_eq!(kind as u8, raw);
        }
        assert!(FrameKind::from_u8(0).is_none());
        assert!(FrameKind::from_u8(8).is_none());
    }

    #[test]
    fn test_flag_accessors() {
        let header = Header::new(
            FrameKind::Payload,
            flags::END_ITEM | flags::END_ALL_ITEMS,
            9,
            0,
            0,
        );

        assert!(header.is_end_item());
        assert!(header.is_end_all_items());
        assert!(!header.is_response());
        assert!(!header.is_from_server());
        assert!(!header.is_control());

        let ping = Header::new(FrameKind::Ping, flags::IS_RESPONSE | flags::FROM_SERVER, 0, 0, 0);
        assert!(ping.is_response());
        assert!(ping.is_from_server());
        assert!(ping.is_control());
    }

    #[test]
    fn test_unary_echo_new_stream_bytes() {
        // Client NewStream for "/svc/echo": kind 1, flags 0, seq 0, len 9.
        let header = Header::new(FrameKind::NewStream, 0, 1, 0, 9);
        let bytes = header.encode();
        assert_eq!(bytes, [0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x00]);
    }
}
