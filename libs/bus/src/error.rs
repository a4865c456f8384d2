//! Error types for the bus client.

use thiserror::Error;

use crate::protocol::MAX_PAYLOAD;

/// Errors raised while parsing the broker's byte stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("control line is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed MSG line: {0}")]
    MalformedMsg(String),

    #[error("payload too large: {0} bytes (max: {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),

    #[error("payload not terminated by CRLF")]
    MissingTerminator,
}

/// Errors surfaced by the bus client.
#[derive(Debug, Error)]
pub enum BusError {
    /// Socket-level failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker's byte stream could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The broker replied with `-ERR`.
    #[error("server error: {0}")]
    Server(String),

    /// The broker sent a line that matches no known operation.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Reconnecting gave up.
    #[error("could not reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The client was closed.
    #[error("connection closed")]
    Closed,

    #[error("invalid bus URI: {0}")]
    InvalidUri(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Errors reported by the broker itself, as opposed to transport failures.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            BusError::Protocol(_) | BusError::Server(_) | BusError::UnknownProtocol(_)
        )
    }
}
