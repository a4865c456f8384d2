//! Shared helpers for the agent integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dea_agent::component::Component;
use dea_agent::config::{Config, ProbePolicies, RuntimeConfig};
use dea_agent::launcher::{Launcher, MockLauncher};
use dea_agent::monitor::{MockProcessMonitor, ProcessMonitor};
use dea_agent::probe::RetryPolicy;
use dea_agent::publisher::RecordingPublisher;
use dea_agent::staging::{MockStager, Stager};
use dea_agent::{Agent, Collaborators, DropletInstance, Endpoint};
use dea_messages::InstanceState;
use serde_json::json;

pub const HOST: &str = "127.0.0.1";
pub const FILE_PORT: u16 = 12345;

/// Readiness schedules short enough for tests.
pub fn fast_probes() -> ProbePolicies {
    ProbePolicies {
        state_file: RetryPolicy::new(10, 100),
        port: RetryPolicy::new(10, 100),
        pid_file: RetryPolicy::new(10, 100),
    }
}

pub fn test_config(base_dir: &Path) -> Config {
    let mut runtimes = BTreeMap::new();
    runtimes.insert(
        "ruby18".to_string(),
        RuntimeConfig {
            executable: "/usr/bin/ruby".to_string(),
            version: "1.8.7".to_string(),
            environment: BTreeMap::from([("RUBYOPT".to_string(), "-rubygems".to_string())]),
            debug_env: BTreeMap::from([(
                "run".to_string(),
                BTreeMap::from([("RUBY_DEBUG".to_string(), "1".to_string())]),
            )]),
        },
    );

    Config {
        base_dir: base_dir.to_path_buf(),
        local_ip: Some(HOST.to_string()),
        max_memory: 512,
        probes: fast_probes(),
        runtimes,
        ..Config::default()
    }
}

/// An agent wired to recording collaborators.
pub struct Harness {
    pub agent: Arc<Agent>,
    pub publisher: Arc<RecordingPublisher>,
    pub launcher: Arc<MockLauncher>,
    pub processes: Arc<MockProcessMonitor>,
    pub base_dir: PathBuf,
}

impl Harness {
    /// Default collaborators; launched apps listen on their port.
    pub fn new(base_dir: &Path) -> Self {
        Self::with(test_config(base_dir), Arc::new(MockStager::new()), MockLauncher::listening())
    }

    /// Builds and recovers the agent.
    pub fn with(config: Config, stager: Arc<dyn Stager>, launcher: MockLauncher) -> Self {
        let harness = Self::build(config, stager, launcher);
        harness.agent.recover().unwrap();
        harness
    }

    /// Builds the agent without recovering it.
    pub fn build(config: Config, stager: Arc<dyn Stager>, launcher: MockLauncher) -> Self {
        Self::wrapped(
            config,
            stager,
            launcher,
            |launcher| launcher as Arc<dyn Launcher>,
            |processes| processes as Arc<dyn ProcessMonitor>,
        )
    }

    /// Builds the agent without recovering it, handing the launcher and
    /// process monitor to the agent through `wrap_launcher` and
    /// `wrap_processes`. The harness keeps the inner mocks.
    pub fn wrapped(
        config: Config,
        stager: Arc<dyn Stager>,
        launcher: MockLauncher,
        wrap_launcher: impl FnOnce(Arc<MockLauncher>) -> Arc<dyn Launcher>,
        wrap_processes: impl FnOnce(Arc<MockProcessMonitor>) -> Arc<dyn ProcessMonitor>,
    ) -> Self {
        let publisher = Arc::new(RecordingPublisher::new());
        let launcher = Arc::new(launcher);
        let processes = Arc::new(MockProcessMonitor::new());
        let base_dir = config.base_dir.clone();

        let component = Arc::new(Component::new(
            "DEA",
            config.index,
            format!("{HOST}:9100"),
            2,
        ));
        let agent = Agent::new(
            config,
            Endpoint {
                host: HOST.to_string(),
                file_port: FILE_PORT,
            },
            component,
            Collaborators {
                publisher: publisher.clone(),
                stager,
                launcher: wrap_launcher(launcher.clone()),
                processes: wrap_processes(processes.clone()),
            },
        );

        Self {
            agent,
            publisher,
            launcher,
            processes,
            base_dir,
        }
    }

    /// Admits and starts an instance, panicking when it is rejected.
    pub fn start(&self, droplet: u64, index: u32, mem_mb: u64) -> Arc<DropletInstance> {
        self.agent
            .on_start(&start_request(droplet, index, mem_mb))
            .expect("start request admitted")
    }

    /// Starts an instance and waits for it to be RUNNING.
    pub async fn start_running(&self, droplet: u64, index: u32) -> Arc<DropletInstance> {
        let instance = self.start(droplet, index, 64);
        assert!(
            wait_for(|| instance.state() == InstanceState::Running).await,
            "instance never reached RUNNING: {:?}",
            instance.state()
        );
        instance
    }
}

pub fn start_payload(droplet: u64, index: u32, mem_mb: u64) -> serde_json::Value {
    json!({
        "droplet": droplet,
        "index": index,
        "name": format!("app{droplet}"),
        "uris": [format!("app{droplet}.example.com")],
        "runtime": "ruby18",
        "framework": "sinatra",
        "sha1": "9f2a4b1c",
        "executableFile": format!("/shared/droplets/{droplet}.tgz"),
        "executableUri": format!("http://cc.example.com/staged_droplets/{droplet}"),
        "version": "v1",
        "services": [],
        "limits": { "mem": mem_mb, "disk": 128, "fds": 256 },
        "env": ["RACK_ENV=production"],
        "users": ["dev@example.com"],
    })
}

pub fn start_request(droplet: u64, index: u32, mem_mb: u64) -> Vec<u8> {
    serde_json::to_vec(&start_payload(droplet, index, mem_mb)).unwrap()
}

/// Polls `condition` every 10 ms for up to 5 s.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
