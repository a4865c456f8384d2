//! Identifier parse errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty identifier")]
    Empty,

    #[error("expected prefix '{expected}', found '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `_` between prefix and ULID.
    #[error("identifier has no '_' separator")]
    MissingSeparator,

    #[error("malformed ULID: {0}")]
    InvalidUlid(String),

    /// Not 32 hex characters after the optional index prefix.
    #[error("malformed component uuid: {0}")]
    InvalidUuid(String),
}
