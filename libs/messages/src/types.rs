//! Shared value types carried inside bus payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable integer key of a deployed application.
pub type DropletId = u64;

/// Default memory limit when a start request omits one, in MB.
pub const DEFAULT_APP_MEM_MB: u64 = 512;

/// Default disk limit when a start request omits one, in MB.
pub const DEFAULT_APP_DISK_MB: u64 = 256;

/// Default file descriptor limit when a start request omits one.
pub const DEFAULT_APP_FDS: u64 = 1024;

// =============================================================================
// Instance State
// =============================================================================

/// Lifecycle state of a droplet instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Stopped,
    Crashed,
    Deleted,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Deleted => "DELETED",
        }
    }

    /// Whether the process is expected to be alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Stopped,
    Crashed,
    DeaShutdown,
    DeaEvacuation,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Stopped => "STOPPED",
            ExitReason::Crashed => "CRASHED",
            ExitReason::DeaShutdown => "DEA_SHUTDOWN",
            ExitReason::DeaEvacuation => "DEA_EVACUATION",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Usage and Limits
// =============================================================================

/// One resource usage sample of a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// When the sample was taken.
    pub time: DateTime<Utc>,
    /// CPU usage in percent of one core.
    pub cpu: f64,
    /// Resident memory in KB.
    pub mem: u64,
    /// Disk usage of the instance directory in bytes.
    pub disk: u64,
}

/// Resource limits requested for an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Memory in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    /// Disk in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<u64>,
    #[serde(default, alias = "num_fds", skip_serializing_if = "Option::is_none")]
    pub fds: Option<u64>,
}

impl Limits {
    pub fn mem_mb(&self) -> u64 {
        self.mem.unwrap_or(DEFAULT_APP_MEM_MB)
    }

    pub fn disk_mb(&self) -> u64 {
        self.disk.unwrap_or(DEFAULT_APP_DISK_MB)
    }

    pub fn fds(&self) -> u64 {
        self.fds.unwrap_or(DEFAULT_APP_FDS)
    }
}

/// A service bound to an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_option: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
}
