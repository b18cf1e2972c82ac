//! Raw codec - pass-through for binary data.
//!
//! Used when a message is already serialized or is inherently raw bytes.
//!
//! # Example
//!
//! ```
//! use wiremux::codec::RawCodec;
//! use bytes::Bytes;
//!
//! let bytes = Bytes::from_static(b"zero copy");
//! let passed = RawCodec::serialize_bytes(bytes.clone());
//! assert_eq!(passed.as_ptr(), bytes.as_ptr()); // same memory
//! ```

use bytes::Bytes;

/// Raw codec that passes bytes through without transformation.
pub struct RawCodec;

impl RawCodec {
    /// Serialize raw bytes (copies data into `Bytes`).
    ///
    /// For true zero-copy, use `serialize_bytes` with an existing `Bytes`.
    #[inline]
    pub fn serialize(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    /// Serialize `Bytes` (zero-copy, just returns the input).
    #[inline]
    pub fn serialize_bytes(data: Bytes) -> Bytes {
        data
    }

    /// Deserialize - returns a reference to the input (zero-copy).
    #[inline]
    pub fn deserialize(data: &[u8]) -> &[u8] {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let original = b"hello world";
        let serialized = RawCodec::serialize(original);
        assert_eq!(RawCodec::deserialize(&serialized), original);
    }

    #[test]
    fn test_serialize_bytes_zero_copy() {
        let original = Bytes::from_static(b"static data");
        let serialized = RawCodec::serialize_bytes(original.clone());
        assert_eq!(serialized.as_ptr(), original.as_ptr());
    }

    #[test]
    fn test_binary_data_preserved() {
        let all_bytes: Vec<u8> = (0..=255).collect();
        let serialized = RawCodec::serialize(&all_bytes);
        assert_eq!(RawCodec::deserialize(&serialized), &all_bytes[..]);
    }
}
