//! Call status codes and the trailer payload encoding.
//!
//! Every stream terminates with a [`Status`]: a numeric code plus a detail
//! message. The code space follows the familiar gRPC assignment so that
//! callers can map statuses onto existing retry/abort policies.

use core::fmt;

use bytes::Bytes;

/// Terminal disposition of a stream.
///
/// Codes 0-14 align with gRPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    /// Success (not an error).
    Ok = 0,
    /// Call was cancelled.
    Cancelled = 1,
    /// Unknown error (unhandled server failure, panic, ...).
    Unknown = 2,
    /// Client sent invalid arguments.
    InvalidArgument = 3,
    /// Deadline passed before completion.
    DeadlineExceeded = 4,
    /// Requested entity not found.
    NotFound = 5,
    /// Entity already exists.
    AlreadyExists = 6,
    /// Caller lacks permission.
    PermissionDenied = 7,
    /// Out of resources (stream ids, queue slots, quota).
    ResourceExhausted = 8,
    /// System not in the required state.
    FailedPrecondition = 9,
    /// Operation aborted.
    Aborted = 10,
    /// Value out of valid range.
    OutOfRange = 11,
    /// Method not bound on the server.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// Connection or transport unavailable.
    Unavailable = 14,
}

impl StatusCode {
    /// Try to convert from a raw u32 value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Cancelled),
            2 => Some(Self::Unknown),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::DeadlineExceeded),
            5 => Some(Self::NotFound),
            6 => Some(Self::AlreadyExists),
            7 => Some(Self::PermissionDenied),
            8 => Some(Self::ResourceExhausted),
            9 => Some(Self::FailedPrecondition),
            10 => Some(Self::Aborted),
            11 => Some(Self::OutOfRange),
            12 => Some(Self::Unimplemented),
            13 => Some(Self::Internal),
            14 => Some(Self::Unavailable),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unknown => write!(f, "unknown"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Aborted => write!(f, "aborted"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Status code plus detail message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Status code.
    pub code: StatusCode,
    /// Human-readable detail (may be empty).
    pub message: String,
}

impl Status {
    /// Create a status from code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Successful completion.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    /// Cancelled by the caller or the peer.
    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, "call cancelled")
    }

    /// Deadline elapsed before the call completed.
    pub fn deadline_exceeded() -> Self {
        Self::new(StatusCode::DeadlineExceeded, "deadline exceeded")
    }

    /// Method name did not resolve on the server.
    pub fn unimplemented(method: &str) -> Self {
        Self::new(StatusCode::Unimplemented, format!("method not found: {method}"))
    }

    /// Connection-level failure.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    /// Unhandled server-side failure.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unknown, message)
    }

    /// Check for success.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Encode as a trailer frame payload.
    ///
    /// Layout: `code: u32 LE | message_len: u32 LE | message bytes`.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(8 + self.message.len());
        buf.extend_from_slice(&(self.code as u32).to_le_bytes());
        buf.extend_from_slice(&(self.message.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.message.as_bytes());
        Bytes::from(buf)
    }

    /// Decode a trailer frame payload.
    ///
    /// Malformed payloads decode to `Internal` rather than failing the
    /// stream a second time.
    pub fn decode(payload: &[u8]) -> Self {
        if payload.len() < 8 {
            return Self::new(StatusCode::Internal, "malformed trailer payload");
        }

        let code = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let message_len =
            u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;

        if payload.len() < 8 + message_len {
            return Self::new(StatusCode::Internal, "malformed trailer payload");
        }

        let code = StatusCode::from_u32(code).unwrap_or(StatusCode::Unknown);
        let message = String::from_utf8_lossy(&payload[8..8 + message_len]).into_owned();

        Self { code, message }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}
