//! # dea-id
//!
//! Typed identifiers used by the droplet execution agent.
//!
//! ## ID Formats
//!
//! Instance ids use a prefixed format: `{prefix}_{ulid}`, for example
//! `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`. They are opaque to the rest of the
//! platform, sort by creation time and are safe to embed in directory names.
//!
//! The component uuid announced on the bus is 32 lowercase hex characters,
//! optionally prefixed with the agent index (`3-6f1c…`).

mod component;
mod error;
mod macros;
mod types;

pub use component::ComponentUuid;
pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
