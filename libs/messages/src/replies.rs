//! Replies and notifications published by the agent.

use dea_id::InstanceId;
use serde::{Deserialize, Serialize};

use crate::types::{DropletId, ExitReason, InstanceState, Usage};

/// Agent greeting, published on `dea.start` and as the discovery reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub id: String,
    pub ip: String,
    /// Port of the droplet file viewer.
    pub port: u16,
    pub version: String,
}

/// `dea.status` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub version: String,
    /// MB.
    pub max_memory: u64,
    /// MB.
    pub reserved_memory: u64,
    /// KB.
    pub used_memory: u64,
    pub num_clients: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Runtime statistics of one instance, used by `droplet.status` replies and
/// the `stats` field of `dea.find.droplet` replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropletStatus {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub uris: Vec<String>,
    /// Seconds since the instance started.
    pub uptime: f64,
    /// Bytes.
    pub mem_quota: u64,
    /// Bytes.
    pub disk_quota: u64,
    pub fds_quota: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
}

/// One `dea.find.droplet` reply, sent per matching instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindDropletReply {
    pub dea: String,
    pub version: String,
    pub droplet: DropletId,
    pub instance: InstanceId,
    pub index: u32,
    pub state: InstanceState,
    /// Seconds since the epoch.
    pub state_timestamp: i64,
    pub file_uri: String,
    pub credentials: Vec<String>,
    pub staged: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<DropletStatus>,
}

/// Per-instance entry of a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub droplet: DropletId,
    pub version: String,
    pub instance: InstanceId,
    pub index: u32,
    pub state: InstanceState,
    pub state_timestamp: i64,
}

/// `dea.heartbeat` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub droplets: Vec<InstanceHeartbeat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterTags {
    pub framework: String,
    pub runtime: String,
}

/// `router.register` / `router.unregister` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterRegistration {
    pub dea: String,
    pub host: String,
    pub port: u16,
    pub uris: Vec<String>,
    pub tags: RouterTags,
}

/// `droplet.exited` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletExited {
    pub droplet: DropletId,
    pub version: String,
    pub instance: InstanceId,
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ExitReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_timestamp: Option<i64>,
}
