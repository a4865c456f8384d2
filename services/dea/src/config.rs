//! Configuration for the droplet execution agent.
//!
//! Loaded from an optional TOML file, then overlaid with `DEA_*` environment
//! variables. Every field has a default, so an empty file is a valid config.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::probe::RetryPolicy;

/// Agent version announced in hello and status messages.
pub const VERSION: &str = "0.99";

/// Time window covered by the per-process usage history.
const USAGE_WINDOW: Duration = Duration::from_secs(60);

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of `apps/`, `staged/` and `db/`.
    pub base_dir: PathBuf,

    /// IP announced to the platform. Detected from the route to the bus
    /// when unset.
    pub local_ip: Option<String>,

    /// Agent index, prefixed to the component uuid.
    pub index: Option<u32>,

    /// Message bus URI, `nats://[user:pass@]host:port`.
    pub bus_uri: String,

    /// Memory available to instances, in MB.
    pub max_memory: u64,

    /// Whether more than one instance may run on this node.
    pub multi_tenant: bool,

    /// Enforce memory and disk quotas and demote CPU hogs.
    pub secure: bool,

    /// Keep instance directories and cached droplets after use.
    pub disable_dir_cleanup: bool,

    /// Shared filesystem holding droplet bits, checked before downloading.
    pub shared_dir: Option<PathBuf>,

    /// Port advertised for the droplet file viewer.
    pub file_viewer_port: u16,

    /// Port of the varz/healthz endpoint; 0 picks an ephemeral port.
    pub status_port: u16,

    pub intervals: Intervals,
    pub probes: ProbePolicies,

    /// Log the droplet collection every `dump_interval`.
    pub dump_apps: bool,

    /// Supported runtimes by name.
    pub runtimes: BTreeMap<String, RuntimeConfig>,
}

/// Periods of the recurring agent tasks, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Intervals {
    pub heartbeat_secs: u64,
    pub monitor_secs: u64,
    pub crash_reaper_secs: u64,
    pub varz_secs: u64,
    pub dump_secs: u64,
    /// How long a crashed instance is kept before the reaper deletes it.
    pub crash_retention_secs: u64,
    /// Delay between evacuation and shutdown.
    pub evacuation_delay_secs: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping an instance.
    pub stop_grace_secs: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            heartbeat_secs: 10,
            monitor_secs: 2,
            crash_reaper_secs: 30,
            varz_secs: 1,
            dump_secs: 30 * 60,
            crash_retention_secs: 60 * 60,
            evacuation_delay_secs: 30,
            stop_grace_secs: 5,
        }
    }
}

/// Retry schedules of the liveness probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbePolicies {
    pub state_file: RetryPolicy,
    pub port: RetryPolicy,
    pub pid_file: RetryPolicy,
}

impl Default for ProbePolicies {
    fn default() -> Self {
        Self {
            state_file: RetryPolicy::STATE_FILE,
            port: RetryPolicy::PORT,
            pid_file: RetryPolicy::PID_FILE,
        }
    }
}

/// A runtime applications can be started with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Substituted for `%VCAP_LOCAL_RUNTIME%` in startup scripts.
    pub executable: String,
    pub version: String,
    /// Extra environment for every instance of this runtime.
    pub environment: BTreeMap<String, String>,
    /// Extra environment per debug mode (`run`, `suspend`).
    pub debug_env: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/vcap/dea"),
            local_ip: None,
            index: None,
            bus_uri: "nats://localhost:4222".to_string(),
            max_memory: 4096,
            multi_tenant: true,
            secure: false,
            disable_dir_cleanup: false,
            shared_dir: None,
            file_viewer_port: 0,
            status_port: 0,
            intervals: Intervals::default(),
            probes: ProbePolicies::default(),
            dump_apps: false,
            runtimes: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load the config file (if any), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Overlay `DEA_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("DEA_BASE_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Ok(uri) = std::env::var("DEA_BUS_URI") {
            self.bus_uri = uri;
        }
        if let Ok(ip) = std::env::var("DEA_LOCAL_IP") {
            self.local_ip = Some(ip);
        }

        self.index = env_parse("DEA_INDEX").or(self.index);
        self.max_memory = env_parse("DEA_MAX_MEMORY").unwrap_or(self.max_memory);
        self.multi_tenant = env_parse("DEA_MULTI_TENANT").unwrap_or(self.multi_tenant);
        self.secure = env_parse("DEA_SECURE").unwrap_or(self.secure);
        self.file_viewer_port = env_parse("DEA_FILE_VIEWER_PORT").unwrap_or(self.file_viewer_port);
        self.status_port = env_parse("DEA_STATUS_PORT").unwrap_or(self.status_port);
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.base_dir.join("apps")
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.base_dir.join("staged")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.db_dir().join("applications.json")
    }

    pub fn max_clients(&self) -> u64 {
        if self.multi_tenant {
            1024
        } else {
            1
        }
    }

    /// Usage samples kept per process.
    pub fn max_usage_samples(&self) -> usize {
        let monitor = self.intervals.monitor_secs.max(1);
        (USAGE_WINDOW.as_secs() / monitor).max(1) as usize
    }

    pub fn runtime(&self, name: &str) -> Option<&RuntimeConfig> {
        self.runtimes.get(name)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
