//! Error types for the BLIP core.

use thiserror::Error;

/// Main error type for all BLIP operations.
///
/// Wire-level variants (`BadFrame`, `BadData`) are fatal to the session:
/// the connection records them, closes the transport and surfaces them via
/// [`Connection::closed`](crate::Connection::closed). Errors carried inside
/// ERR responses use [`ErrorCode`] instead and never take the session down.
#[derive(Debug, Clone, Error)]
pub enum BlipError {
    /// Malformed frame: bad varint, out-of-range flags, unknown message
    /// number, non-monotonic ack.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// Malformed payload data: bad property block, decompression failure.
    #[error("bad data: {0}")]
    BadData(String),

    /// The transport closed underneath the session.
    #[error("disconnected")]
    Disconnected,

    /// The peer refused the connection (e.g. subprotocol not negotiated).
    #[error("peer not allowed")]
    PeerNotAllowed,

    /// Transport-level failure (socket error, handshake failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// Misuse of the API surfaced synchronously to the caller
    /// (e.g. replying twice, replying to a NoReply request).
    #[error("invalid use: {0}")]
    InvalidState(String),

    /// Anything else.
    #[error("{0}")]
    Misc(String),
}

/// Result type alias using BlipError.
pub type Result<T> = std::result::Result<T, BlipError>;

/// Error codes carried on the wire inside ERR responses.
///
/// The numeric values follow the HTTP-flavored registry of the protocol;
/// codes outside this set travel as their raw number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    BadRange = 416,
    HandlerFailed = 501,
    /// Sentinel for a missing or unparseable `Error-Code` property.
    Unspecified = 599,
}

impl ErrorCode {
    /// The numeric wire value.
    #[inline]
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::BadRequest.code(), 400);
        assert_eq!(ErrorCode::Forbidden.code(), 403);
        assert_eq!(ErrorCode::NotFound.code(), 404);
        assert_eq!(ErrorCode::BadRange.code(), 416);
        assert_eq!(ErrorCode::HandlerFailed.code(), 501);
        assert_eq!(ErrorCode::Unspecified.code(), 599);
    }

    #[test]
    fn test_error_display() {
        let err = BlipError::BadFrame("flags out of range".to_string());
        assert!(err.to_string().contains("bad frame"));
        assert!(err.to_string().contains("flags out of range"));
    }
}
