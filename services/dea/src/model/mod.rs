//! Droplets, their instances and the records persisted for them.

mod droplet;
mod instance;
pub(crate) mod record;

pub use droplet::{Droplet, DropletCollection, SnapshotDocument};
pub use instance::{DropletInstance, StopTicket, UriDelta, MAX_NICE};
pub use record::{log_id, staged_name, InstanceRecord};
