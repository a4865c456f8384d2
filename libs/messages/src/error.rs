//! Error types for message decoding.

use thiserror::Error;

/// Errors that can occur when decoding or encoding bus payloads.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The payload was empty where a JSON document was expected.
    #[error("empty payload")]
    EmptyPayload,

    /// The payload is not valid JSON for the expected message type.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}
