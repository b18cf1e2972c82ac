//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary frame format:
//! - 8-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, build_frame_parts, control_header, payload_header, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{flags, FrameKind, Header, CONTROL_STREAM_ID, HEADER_SIZE, MAX_PAYLOAD_SIZE};
