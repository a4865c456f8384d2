//! Droplet Execution Agent Library
//!
//! The agent runs on every application node. It takes start requests from
//! the message bus, stages the droplet bits, launches the application and
//! watches it until it is stopped, crashes or the node is drained.
//!
//! ## Architecture
//!
//! ```text
//! bus client ──► Agent handlers ──► lifecycle ──► Stager / Launcher
//!                     │                 │
//!                     ▼                 ▼
//!               query replies     DropletCollection ◄── monitoring pass
//!                                       │
//!                                       ▼
//!                                 SnapshotStore (applications.json)
//! ```
//!
//! ## Modules
//!
//! - `agent`: the agent façade, lifecycle, handlers and monitoring pass
//! - `model`: droplets, instances and their persisted records
//! - `ledger`: reserved memory and client accounting
//! - `snapshot`: debounced persistence and recovery of the collection
//! - `staging`: fetching and unpacking droplet bits
//! - `launcher`: starting and stopping instance processes
//! - `monitor`: process table and disk usage sampling
//! - `component`: platform registration and the varz/healthz endpoint
//! - `tasks`: recurring heartbeat, monitor, reaper and varz loops

pub mod agent;
pub mod component;
pub mod config;
pub mod environment;
pub mod launcher;
pub mod ledger;
pub mod model;
pub mod monitor;
pub mod net;
pub mod probe;
pub mod publisher;
pub mod resources;
pub mod snapshot;
pub mod staging;
pub mod tasks;

// Re-export commonly used types
pub use agent::{Agent, Collaborators, Endpoint};
pub use config::Config;
pub use model::{DropletCollection, DropletInstance, InstanceRecord};
