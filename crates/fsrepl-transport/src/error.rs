//! Error types for the transport subsystem.

use std::fmt;

use thiserror::Error;

/// Error reported by the remote handler of a call.
///
/// The transport treats `code` as opaque; the layer above decides what the
/// codes mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Classification code chosen by the handler.
    pub code: u16,
    /// Human readable message, delivered verbatim to the caller.
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Encode as `code (u16 BE) ++ utf8 message`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.message.len());
        buf.extend_from_slice(&self.code.to_be_bytes());
        buf.extend_from_slice(self.message.as_bytes());
        buf
    }

    /// Decode from the layout produced by [`RemoteError::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(TransportError::InvalidFrame {
                reason: "error reply shorter than its code".to_string(),
            });
        }
        let code = u16::from_be_bytes([buf[0], buf[1]]);
        let message = String::from_utf8_lossy(&buf[2..]).into_owned();
        Ok(Self { code, message })
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Errors that can occur in the transport subsystem.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connecting did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address that was dialed.
        addr: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The peer closed the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A previous call on this connection was abandoned mid-flight.
    #[error("connection poisoned by an abandoned call")]
    ConnectionPoisoned,

    /// A frame violated the framing rules.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// Magic number mismatch.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic.
        expected: u32,
        /// Received magic.
        got: u32,
    },

    /// Protocol version mismatch.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Version spoken locally.
        expected: u8,
        /// Version received.
        got: u8,
    },

    /// Payload checksum mismatch.
    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum computed over the payload.
        computed: u32,
    },

    /// Payload exceeds the frame size limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Announced payload size.
        size: u32,
        /// Maximum allowed.
        max_size: u32,
    },

    /// No reply arrived in time.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Call that timed out.
        request_id: u64,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// A frame arrived that is not valid at this point of the exchange.
    #[error("unexpected {got} frame while waiting for {expected}")]
    UnexpectedFrame {
        /// What the exchange expected.
        expected: &'static str,
        /// Frame kind that arrived.
        got: &'static str,
    },

    /// The sending side aborted a data stream.
    #[error("stream aborted by peer: {0}")]
    StreamAborted(String),

    /// The remote handler failed the call.
    #[error("{0}")]
    Remote(RemoteError),

    /// I/O error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Result alias for the transport subsystem.
pub type Result<T> = std::result::Result<T, TransportError>;
