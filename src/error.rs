//! Error types for wiremux.

use thiserror::Error;

use crate::status::Status;

/// Main error type for all wiremux operations.
#[derive(Debug, Error)]
pub enum WiremuxError {
    /// I/O error on the underlying byte transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed header, bad flags, sequence mismatch, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A call terminated with a non-OK status.
    #[error("RPC failed: {0}")]
    Rpc(Status),

    /// Connection closed (locally or by the peer).
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - outbound queue stayed full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl WiremuxError {
    /// The terminal status carried by this error, if any.
    pub fn status(&self) -> Option<&Status> {
        match self {
            WiremuxError::Rpc(status) => Some(status),
            _ => None,
        }
    }
}

impl From<Status> for WiremuxError {
    fn from(status: Status) -> Self {
        WiremuxError::Rpc(status)
    }
}

/// Result type alias using WiremuxError.
pub type Result<T> = std::result::Result<T, WiremuxError>;
