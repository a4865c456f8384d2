//! # dea-messages
//!
//! Typed payloads for every bus subject the agent consumes or publishes.
//!
//! ## Design Principles
//!
//! - Each subject has one request or reply struct; payloads are decoded once
//!   at the handler boundary and never passed around as loose JSON maps
//! - Optional fields are `Option<_>` or carry a serde default, so a missing
//!   key is handled by the type rather than by the caller
//! - Field names match the platform's wire names (`executableUri`,
//!   `state_timestamp`), enums serialize by their uppercase name
//!
//! ## Subjects
//!
//! - Inbound: `dea.status`, `dea.discover`, `dea.find.droplet`, `dea.update`,
//!   `dea.stop`, `dea.{uuid}.start`, `droplet.status`, `router.start`,
//!   `healthmanager.start`
//! - Outbound: `dea.start`, `dea.heartbeat`, `router.register`,
//!   `router.unregister`, `droplet.exited`

mod error;
mod replies;
mod requests;
pub mod subjects;
mod types;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use error::MessageError;
pub use replies::*;
pub use requests::*;
pub use types::*;

/// Decodes a bus payload into a typed message.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, MessageError> {
    if payload.is_empty() {
        return Err(MessageError::EmptyPayload);
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Encodes a typed message as a bus payload.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, MessageError> {
    Ok(serde_json::to_vec(message)?)
}
