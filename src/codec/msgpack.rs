//! MsgPack codec using `rmp-serde`.
//!
//! # Example
//!
//! ```
//! use wiremux::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for structured data.
///
/// Uses the compact positional struct encoding; both ends of a connection
/// run the same codec, so field names are not carried on the wire.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be deserialized to type `T`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_scalar() {
        let encoded = MsgPackCodec::encode(&42i64).unwrap();
        let decoded: i64 = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, 42);
    }

    #[test]
    fn test_roundtrip_struct() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            name: String,
            values: Vec<u32>,
        }

        let payload = Payload {
            name: "test".into(),
            values: vec![1, 2, 3],
        };
        let encoded = MsgPackCodec::encode(&payload).unwrap();
        let decoded: Payload = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_wrong_type_fails() {
        let encoded = MsgPackCodec::encode(&"not a number").unwrap();
        let result: Result<u64> = MsgPackCodec::decode(&encoded);
        assert!(result.is_err());
    }
}
