//! Requests received by the agent.

use dea_id::InstanceId;
use serde::{Deserialize, Serialize};

use crate::types::{DropletId, InstanceState, Limits, ServiceBinding};

/// `dea.{uuid}.start`: run a new instance of a droplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub droplet: DropletId,
    #[serde(default)]
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub sha1: String,
    #[serde(rename = "executableFile", default)]
    pub executable_file: String,
    #[serde(rename = "executableUri", default)]
    pub executable_uri: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
    #[serde(default)]
    pub limits: Limits,
    /// User environment as `KEY=value` entries.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    /// Debug mode, e.g. `"run"` or `"suspend"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl StartRequest {
    /// Whether the fields needed to fetch the droplet bits are present.
    pub fn has_bits_source(&self) -> bool {
        !self.sha1.is_empty() && !self.executable_file.is_empty() && !self.executable_uri.is_empty()
    }
}

/// Selects instances of one droplet. Absent criteria match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub droplet: DropletId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<InstanceId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indices: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<InstanceState>>,
}

impl InstanceFilter {
    pub fn matches(
        &self,
        droplet: DropletId,
        version: &str,
        instance: &InstanceId,
        index: u32,
        state: InstanceState,
    ) -> bool {
        self.droplet == droplet
            && self.version.as_deref().is_none_or(|v| v == version)
            && self.instances.as_ref().is_none_or(|ids| ids.contains(instance))
            && self.indices.as_ref().is_none_or(|ix| ix.contains(&index))
            && self.states.as_ref().is_none_or(|s| s.contains(&state))
    }
}

/// `dea.stop`: stop matching instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(flatten)]
    pub filter: InstanceFilter,
}

/// `dea.find.droplet`: report on matching instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindDropletRequest {
    #[serde(flatten)]
    pub filter: InstanceFilter,
    #[serde(default)]
    pub include_stats: bool,
}

/// `dea.update`: replace the URIs of every instance of a droplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub droplet: DropletId,
    #[serde(default)]
    pub uris: Vec<String>,
}

/// `dea.discover`: can this agent host the droplet?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    #[serde(default)]
    pub droplet: DropletId,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub limits: Limits,
}
