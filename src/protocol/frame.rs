//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload. The
//! payload is a `bytes::Bytes` lease: cloning preserves the underlying
//! buffer, dropping the last clone releases it (back to the pool when the
//! payload was staged there). Forwarding a frame across tasks is therefore
//! a ref-count bump, never a copy.

use bytes::Bytes;

use super::wire_format::{FrameKind, Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        debug_assert_eq!(header.payload_length as usize, payload.len());
        Self { header, payload }
    }

    /// Create a frame from header fields and raw bytes (copies data).
    pub fn from_parts(header: Header, payload: &[u8]) -> Self {
        Self {
            header,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the frame kind.
    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    /// Get the stream id.
    #[inline]
    pub fn stream_id(&self) -> u16 {
        self.header.stream_id
    }

    /// Get the sequence id.
    #[inline]
    pub fn sequence_id(&self) -> u16 {
        self.header.sequence_id
    }

    /// Check if this frame ends one logical message.
    #[inline]
    pub fn is_end_item(&self) -> bool {
        self.header.is_end_item()
    }

    /// Check if this frame ends the sender's half of the stream.
    #[inline]
    pub fn is_end_all_items(&self) -> bool {
        self.header.is_end_all_items()
    }

    /// Check if this is a control-frame echo.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    /// Check if the sender was the server side of its connection.
    #[inline]
    pub fn is_from_server(&self) -> bool {
        self.header.is_from_server()
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes the header and appends the payload into a contiguous buffer.
///
/// # Example
///
/// ```
/// use wiremux::protocol::{build_frame, FrameKind, Header, HEADER_SIZE};
///
/// let header = Header::new(FrameKind::Payload, 0x03, 1, 0, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.payload_length as usize, payload.len());
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Build frame parts for scatter/gather I/O.
///
/// Returns the encoded header and a reference to the payload, avoiding a
/// copy for writev-style operations.
pub fn build_frame_parts<'a>(header: &Header, payload: &'a [u8]) -> ([u8; HEADER_SIZE], &'a [u8]) {
    (header.encode(), payload)
}

/// Shorthand for a payload header with the given flags.
pub fn payload_header(kind_flags: u8, stream_id: u16, sequence_id: u16, len: usize) -> Header {
    debug_assert!(len <= u16::MAX as usize);
    Header::new(FrameKind::Payload, kind_flags, stream_id, sequence_id, len as u16)
}

/// Shorthand for an empty control frame on a stream.
pub fn control_header(kind: FrameKind, kind_flags: u8, stream_id: u16) -> Header {
    Header::new(kind, kind_flags, stream_id, 0, 0)
}
