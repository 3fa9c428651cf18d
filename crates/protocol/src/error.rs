//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Socket errors
    /// The physical socket is gone. The logical session may still be
    /// revived by a reconnect.
    #[error("socket closed")]
    SocketClosed,

    /// I/O failure on the physical socket.
    #[error("socket error: {0}")]
    SocketError(String),

    // Handshake errors
    /// Malformed or out-of-sequence handshake message. Fatal to the
    /// connection attempt, not to the logical session.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// What was wrong with the message.
        reason: String,
        /// The raw offending payload, kept for diagnostics.
        payload: Vec<u8>,
    },

    /// No terminal handshake message arrived within the deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The authenticator refused the presented credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Physical connection lost mid-handshake, or the attempt was cancelled.
    #[error("connection lost before handshake completed")]
    ConnectionLost,

    // Session errors
    /// A second physical socket claimed a token whose adoption already
    /// completed. Fatal to the losing attempt only.
    #[error("duplicate reconnection for token: {token}")]
    DuplicateReconnection {
        /// The contested reconnection token.
        token: String,
    },

    /// Reconnection claim for a token the registry does not hold.
    #[error("unknown session: {token}")]
    UnknownSession {
        /// The unrecognized reconnection token.
        token: String,
    },

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame has invalid magic bytes.
    #[error("invalid frame magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidFrameMagic {
        /// Expected magic value.
        expected: u32,
        /// Actual magic value received.
        got: u32,
    },

    // Compression errors
    /// Streaming compression failed.
    #[error("deflate failed: {0}")]
    Deflate(String),

    /// Streaming decompression failed.
    #[error("inflate failed: {0}")]
    Inflate(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<flate2::CompressError> for ProtocolError {
    fn from(err: flate2::CompressError) -> Self {
        ProtocolError::Deflate(err.to_string())
    }
}

impl From<flate2::DecompressError> for ProtocolError {
    fn from(err: flate2::DecompressError) -> Self {
        ProtocolError::Inflate(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::SocketClosed,
            _ => ProtocolError::SocketError(err.to_string()),
        }
    }
}
