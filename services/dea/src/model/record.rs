//! The persisted attribute set of one instance.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dea_id::InstanceId;
use dea_messages::{
    DropletExited, DropletId, DropletStatus, ExitReason, InstanceHeartbeat, InstanceState,
    RouterRegistration, RouterTags, ServiceBinding, Usage,
};
use serde::{Deserialize, Serialize};

const MB: u64 = 1024 * 1024;

/// Every attribute of an instance, as written to the snapshot file.
///
/// Also serves as the read-only view handed out by
/// [`DropletInstance::snapshot`](super::DropletInstance::snapshot): a clone
/// taken under the instance lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub droplet_id: DropletId,
    pub instance_id: InstanceId,
    pub instance_index: u32,
    pub name: String,
    #[serde(default)]
    pub version: String,

    pub state: InstanceState,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    /// Seconds since the epoch of the last state change.
    pub state_timestamp: i64,
    pub start: DateTime<Utc>,

    #[serde(default)]
    pub orphaned: bool,
    #[serde(default)]
    pub resources_tracked: bool,
    #[serde(default)]
    pub stop_processed: bool,
    /// `droplet.exited` has been sent.
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub evacuated: bool,

    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub framework: String,
    /// Bytes.
    pub mem_quota: u64,
    /// Bytes.
    pub disk_quota: u64,
    pub fds_quota: u64,

    pub dir: PathBuf,
    /// Directory name under the apps dir.
    pub staged: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub debug_mode: Option<String>,
    #[serde(default)]
    pub debug_ip: Option<String>,
    #[serde(default)]
    pub debug_port: Option<u16>,
    #[serde(default)]
    pub state_file: Option<String>,

    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
    #[serde(default)]
    pub environment_variables: Vec<String>,

    pub log_id: String,
    /// 0 while unknown or not running.
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub nice: i32,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Identifies an instance in log lines.
pub fn log_id(name: &str, droplet: DropletId, instance: &InstanceId, index: u32) -> String {
    format!("(name={name}, app_id={droplet}, instance={instance}, index={index})")
}

/// Name of an instance directory under the apps dir.
pub fn staged_name(name: &str, index: u32, instance: &InstanceId) -> String {
    format!("{name}-{index}-{instance}")
}

impl InstanceRecord {
    /// Records a state change at the current time.
    pub fn set_state(&mut self, state: InstanceState) {
        self.state = state;
        self.state_timestamp = Utc::now().timestamp();
    }

    pub fn mem_quota_mb(&self) -> u64 {
        self.mem_quota / MB
    }

    /// Seconds since the instance was started.
    pub fn uptime(&self) -> f64 {
        (Utc::now() - self.start).num_milliseconds() as f64 / 1000.0
    }

    /// Liveness probing never gives up while the debugger holds the process.
    pub fn debug_suspended(&self) -> bool {
        self.debug_mode.as_deref() == Some("suspend")
    }

    pub fn heartbeat(&self) -> InstanceHeartbeat {
        InstanceHeartbeat {
            droplet: self.droplet_id,
            version: self.version.clone(),
            instance: self.instance_id,
            index: self.instance_index,
            state: self.state,
            state_timestamp: self.state_timestamp,
        }
    }

    pub fn exited_message(&self) -> DropletExited {
        DropletExited {
            droplet: self.droplet_id,
            version: self.version.clone(),
            instance: self.instance_id,
            index: self.instance_index,
            reason: self.exit_reason,
            crash_timestamp: (self.state == InstanceState::Crashed)
                .then_some(self.state_timestamp),
        }
    }

    pub fn router_registration(&self, dea: &str, host: &str) -> RouterRegistration {
        RouterRegistration {
            dea: dea.to_string(),
            host: host.to_string(),
            port: self.port,
            uris: self.uris.clone(),
            tags: RouterTags {
                framework: self.framework.clone(),
                runtime: self.runtime.clone(),
            },
        }
    }

    pub fn status(&self, host: &str, cores: Option<u32>) -> DropletStatus {
        DropletStatus {
            name: self.name.clone(),
            host: host.to_string(),
            port: self.port,
            uris: self.uris.clone(),
            uptime: self.uptime(),
            mem_quota: self.mem_quota,
            disk_quota: self.disk_quota,
            fds_quota: self.fds_quota,
            usage: self.usage.clone(),
            cores,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn record(droplet: DropletId, index: u32) -> InstanceRecord {
        let instance_id = InstanceId::new();
        let name = format!("app{droplet}");
        let staged = staged_name(&name, index, &instance_id);
        InstanceRecord {
            droplet_id: droplet,
            instance_id,
            instance_index: index,
            log_id: log_id(&name, droplet, &instance_id, index),
            name,
            version: "v1".to_string(),
            state: InstanceState::Starting,
            exit_reason: None,
            state_timestamp: Utc::now().timestamp(),
            start: Utc::now(),
            orphaned: false,
            resources_tracked: false,
            stop_processed: false,
            notified: false,
            evacuated: false,
            runtime: "ruby18".to_string(),
            framework: "sinatra".to_string(),
            mem_quota: 64 * MB,
            disk_quota: 128 * MB,
            fds_quota: 1024,
            dir: PathBuf::from("/var/vcap/dea/apps").join(&staged),
            staged,
            port: 0,
            debug_mode: None,
            debug_ip: None,
            debug_port: None,
            state_file: None,
            uris: vec!["app.example.com".to_string()],
            users: vec!["dev@example.com".to_string()],
            services: Vec::new(),
            environment_variables: Vec::new(),
            pid: 0,
            nice: 0,
            usage: None,
        }
    }
}
