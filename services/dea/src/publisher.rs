//! Outbound side of the bus, as seen by the agent.

use std::sync::{Mutex, MutexGuard, PoisonError};

use dea_messages::MessageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Fire-and-forget publishing.
pub trait Publisher: Send + Sync {
    fn publish(&self, subject: &str, payload: &[u8]);
}

impl Publisher for dea_bus::Client {
    fn publish(&self, subject: &str, payload: &[u8]) {
        dea_bus::Client::publish(self, subject, payload, None);
    }
}

/// Encodes `message` and publishes it, logging encode failures.
pub fn publish_json<T: Serialize>(publisher: &dyn Publisher, subject: &str, message: &T) {
    match dea_messages::encode(message) {
        Ok(payload) => publisher.publish(subject, &payload),
        Err(e) => warn!(subject, error = %e, "Failed to encode message"),
    }
}

/// Publisher that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Vec<u8>)>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().clone()
    }

    /// Every message published on `subject`, decoded.
    pub fn decoded<T: DeserializeOwned>(&self, subject: &str) -> Result<Vec<T>, MessageError> {
        self.lock()
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, payload)| dea_messages::decode(payload))
            .collect()
    }

    pub fn count(&self, subject: &str) -> usize {
        self.lock().iter().filter(|(s, _)| s == subject).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, subject: &str, payload: &[u8]) {
        self.lock().push((subject.to_string(), payload.to_vec()));
    }
}
