//! Codec module - serialization/deserialization for message payloads.
//!
//! The runtime core is type-erased: it moves `Bytes` messages. These codecs
//! are the marshaller pairs the typed client/server helpers plug into that
//! seam:
//!
//! - [`RawCodec`] - pass-through for raw bytes (zero-copy)
//! - [`MsgPackCodec`] - MessagePack via `rmp-serde`
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! which allows compile-time codec selection and zero-copy fast paths.

mod msgpack;
mod raw;

pub use msgpack::MsgPackCodec;
pub use raw::RawCodec;
