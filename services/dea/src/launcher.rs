//! Process launch collaborator.
//!
//! - [`Launcher`]: starts an instance's process and later stops it
//! - [`ProcessLauncher`]: runs `<dir>/startup` through `sh` in its own
//!   process group, writing `run.pid` and the logs under `<dir>/logs`
//! - [`MockLauncher`]: records launches and can simulate a listening app

use std::collections::HashMap;
use std::fs::{self, File};
use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dea_id::InstanceId;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::model::InstanceRecord;

/// Resolves with the exit code once the launched process exits. `None`
/// when the process was killed by a signal.
pub type ExitWatch = oneshot::Receiver<Option<i32>>;

/// Name of the pid file in the instance directory.
pub const PID_FILE: &str = "run.pid";

/// Launch collaborator.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Starts the instance's process with `env` as its environment.
    async fn launch(&self, instance: &InstanceRecord, env: &[(String, String)]) -> Result<ExitWatch>;

    /// Stops the instance's process if it is still alive.
    async fn stop(&self, instance: &InstanceRecord) -> Result<()>;
}

// =============================================================================
// Process launcher
// =============================================================================

/// Runs instances as local processes.
pub struct ProcessLauncher {
    stop_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(stop_grace: Duration) -> Self {
        Self { stop_grace }
    }
}

/// Shell script exporting `env` and then replacing itself with the startup
/// script. Values are expected to be shell words already.
fn launch_script(env: &[(String, String)]) -> String {
    let mut script = String::new();
    for (key, value) in env {
        script.push_str(&format!("export {key}={value}\n"));
    }
    script.push_str("exec sh ./startup\n");
    script
}

fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn signal_group(pid: i32, signal: i32) {
    unsafe {
        if libc::kill(-pid, signal) != 0 {
            libc::kill(pid, signal);
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, instance: &InstanceRecord, env: &[(String, String)]) -> Result<ExitWatch> {
        let logs = instance.dir.join("logs");
        fs::create_dir_all(&logs)
            .with_context(|| format!("Failed to create {}", logs.display()))?;
        let stdout = File::create(logs.join("stdout.log"))?;
        let stderr = File::create(logs.join("stderr.log"))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(launch_script(env))
            .current_dir(&instance.dir)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into()))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to start {}", instance.log_id))?;

        let pid = child.id().context("Launched process has no pid")?;
        fs::write(instance.dir.join(PID_FILE), format!("{pid}\n"))?;
        info!(log_id = %instance.log_id, pid, "Launched instance");

        let (tx, rx) = oneshot::channel();
        let log_id = instance.log_id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(log_id = %log_id, error = %e, "Failed to wait for instance process");
                    None
                }
            };
            debug!(log_id = %log_id, ?code, "Instance process exited");
            let _ = tx.send(code);
        });
        Ok(rx)
    }

    async fn stop(&self, instance: &InstanceRecord) -> Result<()> {
        let pid = match instance.pid {
            0 => read_pid(&instance.dir),
            pid => Some(pid),
        };
        let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
            debug!(log_id = %instance.log_id, "No process to stop");
            return Ok(());
        };

        signal_group(pid, libc::SIGTERM);
        let deadline = tokio::time::Instant::now() + self.stop_grace;
        while tokio::time::Instant::now() < deadline {
            if !pid_alive(pid) {
                info!(log_id = %instance.log_id, pid, "Instance process stopped");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!(log_id = %instance.log_id, pid, "Instance ignored SIGTERM, killing");
        signal_group(pid, libc::SIGKILL);
        Ok(())
    }
}

fn read_pid(dir: &Path) -> Option<u32> {
    fs::read_to_string(dir.join(PID_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|pid| *pid > 0)
}

// =============================================================================
// Mock launcher
// =============================================================================

#[derive(Default)]
struct MockState {
    launches: Vec<(InstanceId, Vec<(String, String)>)>,
    stops: Vec<InstanceId>,
    exits: HashMap<InstanceId, oneshot::Sender<Option<i32>>>,
    listeners: HashMap<InstanceId, TcpListener>,
}

/// Launcher for tests. Nothing is executed.
#[derive(Default)]
pub struct MockLauncher {
    state: Mutex<MockState>,
    listen: bool,
    pid: Option<u32>,
    fail: bool,
}

impl MockLauncher {
    /// A launcher whose instances never open their port.
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher whose instances accept connections on their port.
    pub fn listening() -> Self {
        Self {
            listen: true,
            ..Self::default()
        }
    }

    /// A launcher whose every launch fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Writes `pid` to the pid file of every launched instance.
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn launches(&self) -> Vec<InstanceId> {
        self.lock().launches.iter().map(|(id, _)| *id).collect()
    }

    /// Environment passed to the launch of `instance`.
    pub fn environment(&self, instance: &InstanceId) -> Option<Vec<(String, String)>> {
        self.lock()
            .launches
            .iter()
            .find(|(id, _)| id == instance)
            .map(|(_, env)| env.clone())
    }

    pub fn stops(&self) -> Vec<InstanceId> {
        self.lock().stops.clone()
    }

    /// Simulates the process of `instance` exiting with `code`.
    pub fn exit(&self, instance: &InstanceId, code: Option<i32>) -> bool {
        let mut state = self.lock();
        state.listeners.remove(instance);
        state
            .exits
            .remove(instance)
            .is_some_and(|tx| tx.send(code).is_ok())
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, instance: &InstanceRecord, env: &[(String, String)]) -> Result<ExitWatch> {
        if self.fail {
            anyhow::bail!("Mock launcher configured to fail");
        }
        info!(log_id = %instance.log_id, port = instance.port, "[MOCK] Launching instance");

        if let Some(pid) = self.pid {
            fs::create_dir_all(&instance.dir)?;
            fs::write(instance.dir.join(PID_FILE), format!("{pid}\n"))?;
        }

        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if self.listen {
            let listener = TcpListener::bind(("127.0.0.1", instance.port))
                .with_context(|| format!("Failed to bind port {}", instance.port))?;
            state.listeners.insert(instance.instance_id, listener);
        }
        state.launches.push((instance.instance_id, env.to_vec()));
        state.exits.insert(instance.instance_id, tx);
        Ok(rx)
    }

    async fn stop(&self, instance: &InstanceRecord) -> Result<()> {
        info!(log_id = %instance.log_id, "[MOCK] Stopping instance");
        let mut state = self.lock();
        state.stops.push(instance.instance_id);
        state.listeners.remove(&instance.instance_id);
        state.exits.remove(&instance.instance_id);
        Ok(())
    }
}
