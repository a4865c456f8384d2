//! Instance lifecycle: admit, stage, launch, detect readiness, stop.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dea_id::InstanceId;
use dea_messages::{subjects, ExitReason, Heartbeat, InstanceState, StartRequest};
use futures_util::future::join_all;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::Agent;
use crate::environment::instance_environment;
use crate::launcher::{ExitWatch, PID_FILE};
use crate::ledger::AdmissionError;
use crate::model::{log_id, staged_name, DropletInstance, InstanceRecord};
use crate::net::grab_ephemeral_port;
use crate::probe::{self, Probe, ProbeOutcome};
use crate::publisher::publish_json;
use crate::staging::StageRequest;

/// Optional declaration an application ships next to its startup script.
pub const STATE_FILE_DECL: &str = "droplet.json";

const MB: u64 = 1024 * 1024;

/// Directory removal attempts before giving up.
const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Pause between stopping every instance and the final snapshot.
const SHUTDOWN_SETTLE: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
struct DropletDecl {
    state_file: Option<String>,
}

/// The state file an application declares in `droplet.json`, if any.
pub async fn read_state_file_decl(dir: &Path) -> Option<String> {
    let contents = tokio::fs::read(dir.join(STATE_FILE_DECL)).await.ok()?;
    serde_json::from_slice::<DropletDecl>(&contents)
        .ok()?
        .state_file
        .filter(|file| !file.is_empty())
}

impl Agent {
    // =========================================================================
    // Admission
    // =========================================================================

    /// Admits a start request, reserving its resources before any
    /// asynchronous work happens.
    pub fn admit(&self, request: &StartRequest) -> Result<Arc<DropletInstance>, AdmissionError> {
        if self.is_shutting_down() {
            return Err(AdmissionError::ShuttingDown);
        }
        if self.config.runtime(&request.runtime).is_none() {
            return Err(AdmissionError::UnsupportedRuntime(request.runtime.clone()));
        }
        if !request.has_bits_source() {
            return Err(AdmissionError::MissingBitsSource);
        }

        let instance_id = InstanceId::new();
        let staged = staged_name(&request.name, request.index, &instance_id);
        let now = Utc::now();
        let record = InstanceRecord {
            droplet_id: request.droplet,
            instance_id,
            instance_index: request.index,
            name: request.name.clone(),
            version: request.version.clone(),
            state: InstanceState::Starting,
            exit_reason: None,
            state_timestamp: now.timestamp(),
            start: now,
            orphaned: false,
            resources_tracked: false,
            stop_processed: false,
            notified: false,
            evacuated: false,
            runtime: request.runtime.clone(),
            framework: request.framework.clone(),
            mem_quota: request.limits.mem_mb() * MB,
            disk_quota: request.limits.disk_mb() * MB,
            fds_quota: request.limits.fds(),
            dir: self.config.apps_dir().join(&staged),
            staged,
            port: 0,
            debug_mode: request.debug.clone().filter(|mode| !mode.is_empty()),
            debug_ip: None,
            debug_port: None,
            state_file: None,
            uris: request.uris.clone(),
            users: request.users.clone(),
            services: request.services.clone(),
            environment_variables: request.env.clone(),
            log_id: log_id(&request.name, request.droplet, &instance_id, request.index),
            pid: 0,
            nice: 0,
            usage: None,
        };

        let instance = Arc::new(DropletInstance::new(record));
        self.ledger
            .try_reserve(&instance, self.config.max_memory, self.config.max_clients())?;
        self.droplets.add_instance(Arc::clone(&instance));
        self.snapshots.schedule();
        Ok(instance)
    }

    /// Handles `dea.{uuid}.start`. Rejected requests get no reply.
    pub fn on_start(self: &Arc<Self>, payload: &[u8]) -> Option<Arc<DropletInstance>> {
        let request: StartRequest = match dea_messages::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed start request");
                return None;
            }
        };

        let instance = match self.admit(&request) {
            Ok(instance) => instance,
            Err(e) => {
                info!(droplet = request.droplet, name = %request.name, reason = %e, "Start request not admitted");
                return None;
            }
        };

        let record = instance.snapshot();
        info!(log_id = %record.log_id, mem_mb = record.mem_quota_mb(), "Starting instance");

        let stage = StageRequest {
            bits_uri: request.executable_uri,
            bits_file: request.executable_file,
            sha1: request.sha1,
            target_dir: record.dir,
            runtime_executable: self
                .config
                .runtime(&record.runtime)
                .map(|runtime| runtime.executable.clone())
                .filter(|executable| !executable.is_empty()),
        };
        tokio::spawn(Arc::clone(self).start_instance(Arc::clone(&instance), stage));
        Some(instance)
    }

    // =========================================================================
    // Start
    // =========================================================================

    async fn start_instance(self: Arc<Self>, instance: Arc<DropletInstance>, stage: StageRequest) {
        let exit = match self.stage_and_launch(&instance, &stage).await {
            Ok(Some(exit)) => exit,
            Ok(None) => return,
            Err(e) => {
                warn!(log_id = %instance.log_id(), error = %format!("{e:#}"), "Failed to start instance");
                instance.mark_crashed();
                self.stop_droplet(&instance).await;
                return;
            }
        };

        tokio::spawn(Arc::clone(&self).watch_exit(Arc::clone(&instance), exit));
        tokio::spawn(Arc::clone(&self).detect_pid(Arc::clone(&instance)));
        self.detect_app_ready(&instance).await;
    }

    /// Stages the bits and launches the process. `None` when the instance
    /// was stopped while staging.
    async fn stage_and_launch(
        &self,
        instance: &DropletInstance,
        stage: &StageRequest,
    ) -> Result<Option<ExitWatch>> {
        self.stager
            .stage_app_bits(stage)
            .await
            .context("Failed to stage droplet")?;
        if instance.state() != InstanceState::Starting {
            debug!(log_id = %instance.log_id(), "Instance left STARTING while staging");
            self.discard_stopped_dir(instance).await;
            return Ok(None);
        }

        let port = grab_ephemeral_port().context("Failed to allocate a port")?;
        let debug = match instance.snapshot().debug_mode {
            Some(_) => {
                let debug_port = grab_ephemeral_port().context("Failed to allocate a debug port")?;
                Some((self.host().to_string(), debug_port))
            }
            None => None,
        };
        instance.assign_ports(port, debug);
        instance.set_state_file(read_state_file_decl(&stage.target_dir).await);

        let record = instance.snapshot();
        let env = instance_environment(&record, self.host(), self.config.runtime(&record.runtime));
        let exit = self
            .launcher
            .launch(&record, &env)
            .await
            .context("Failed to launch instance")?;

        if instance.stop_processed() {
            // Stopped while launching: the stop found no process to kill.
            let record = instance.snapshot();
            info!(log_id = %record.log_id, "Instance stopped while launching, killing process");
            if let Err(e) = self.launcher.stop(&record).await {
                warn!(log_id = %record.log_id, error = %format!("{e:#}"), "Failed to stop launched process");
            }
            self.discard_stopped_dir(instance).await;
            return Ok(None);
        }
        Ok(Some(exit))
    }

    /// Deletes the directory of an instance stopped before its process was
    /// tracked. Staging may have recreated it after the stop cleaned up.
    async fn discard_stopped_dir(&self, instance: &DropletInstance) {
        let record = instance.snapshot();
        if !record.stop_processed || record.state == InstanceState::Crashed || self.config.disable_dir_cleanup {
            return;
        }
        remove_dir_with_retries(&record.dir, &record.log_id).await;
    }

    async fn watch_exit(self: Arc<Self>, instance: Arc<DropletInstance>, exit: ExitWatch) {
        let Ok(code) = exit.await else {
            return;
        };
        if instance.stop_processed() {
            debug!(log_id = %instance.log_id(), ?code, "Stopped instance exited");
            return;
        }

        info!(log_id = %instance.log_id(), ?code, "Instance exited unexpectedly");
        if instance.mark_crashed() {
            self.stop_droplet(&instance).await;
        }
    }

    /// Polls for the pid file written by the launcher.
    async fn detect_pid(self: Arc<Self>, instance: Arc<DropletInstance>) {
        let path = instance.snapshot().dir.join(PID_FILE);
        let (path, target) = (&path, &instance);

        let outcome = self
            .config
            .probes
            .pid_file
            .run(move || async move {
                if target.stop_processed() {
                    return Probe::Abort;
                }
                match probe::read_pid_file(path).await {
                    Some(pid) if target.set_pid(pid) => Probe::Ready,
                    Some(_) => Probe::Abort,
                    None => Probe::Pending,
                }
            })
            .await;

        match outcome {
            ProbeOutcome::Ready => {
                let record = instance.snapshot();
                info!(log_id = %record.log_id, pid = record.pid, "Instance pid detected");
                self.snapshots.schedule();
            }
            ProbeOutcome::Aborted => debug!(log_id = %instance.log_id(), "Pid detection aborted"),
            ProbeOutcome::Exhausted { attempts } => {
                warn!(log_id = %instance.log_id(), attempts, "Giving up on pid detection");
            }
        }
    }

    /// Waits for the application to come up, through its state file when it
    /// declares one and through its port otherwise.
    pub(super) async fn detect_app_ready(self: &Arc<Self>, instance: &Arc<DropletInstance>) {
        let record = instance.snapshot();
        let target = instance.as_ref();

        let outcome = match &record.state_file {
            Some(state_file) => {
                let policy = if record.debug_suspended() {
                    self.config.probes.state_file.unbounded()
                } else {
                    self.config.probes.state_file
                };
                let path = record.dir.join(state_file);
                let path = &path;
                policy
                    .run(move || async move {
                        if target.state() != InstanceState::Starting {
                            Probe::Abort
                        } else if probe::state_file_running(path).await {
                            Probe::Ready
                        } else {
                            Probe::Pending
                        }
                    })
                    .await
            }
            None => {
                let (host, port) = (self.host(), record.port);
                self.config
                    .probes
                    .port
                    .run(move || async move {
                        if target.state() != InstanceState::Starting {
                            Probe::Abort
                        } else if probe::port_open(host, port).await {
                            Probe::Ready
                        } else {
                            Probe::Pending
                        }
                    })
                    .await
            }
        };

        match outcome {
            ProbeOutcome::Ready => {
                let Some(record) = instance.mark_running() else {
                    return;
                };
                info!(log_id = %record.log_id, port = record.port, "Instance is running");
                publish_json(
                    self.publisher.as_ref(),
                    subjects::DEA_HEARTBEAT,
                    &Heartbeat {
                        droplets: vec![record.heartbeat()],
                    },
                );
                self.register_routes(&record);
                self.snapshots.schedule();
            }
            ProbeOutcome::Aborted => {
                debug!(log_id = %record.log_id, "Readiness detection aborted");
            }
            ProbeOutcome::Exhausted { attempts } => {
                warn!(log_id = %record.log_id, attempts, "Giving up on instance");
                self.stop_droplet(instance).await;
            }
        }
    }

    // =========================================================================
    // Stop and cleanup
    // =========================================================================

    /// Stops an instance. Only the first call on an instance has effect.
    ///
    /// Notifications go out before the process is torn down so traffic is
    /// drained first.
    pub async fn stop_droplet(self: &Arc<Self>, instance: &Arc<DropletInstance>) {
        let Some(ticket) = instance.begin_stop() else {
            return;
        };
        let record = &ticket.record;
        info!(
            log_id = %record.log_id,
            state = %record.state,
            reason = ?record.exit_reason,
            "Stopping instance"
        );

        if let Some(exited) = &ticket.exited {
            publish_json(self.publisher.as_ref(), subjects::DROPLET_EXITED, exited);
        }
        if ticket.unregister {
            self.unregister_routes(record);
        }

        if ticket.run_stop_hook {
            if let Err(e) = self.launcher.stop(record).await {
                warn!(log_id = %record.log_id, error = %format!("{e:#}"), "Stop hook failed");
            }
        }

        self.cleanup(instance, record).await;
    }

    /// Releases the instance's resources. Everything but crashed instances
    /// is also forgotten and its directory deleted.
    async fn cleanup(&self, instance: &DropletInstance, record: &InstanceRecord) {
        self.ledger.release(instance);
        if record.pid != 0 {
            self.usage.remove(record.pid);
        }

        if record.state != InstanceState::Crashed {
            self.droplets.remove_instance(instance);
            if !self.config.disable_dir_cleanup {
                remove_dir_with_retries(&record.dir, &record.log_id).await;
            }
        }
        self.snapshots.schedule();
    }

    /// Deletes instances that have been CRASHED longer than the retention
    /// window. Returns how many were reaped.
    pub async fn reap_crashed(&self) -> usize {
        let retention = self.config.intervals.crash_retention_secs as i64;
        let now = Utc::now().timestamp();
        let mut reaped = 0;

        for instance in self.droplets.instances() {
            let record = instance.snapshot();
            if record.state != InstanceState::Crashed || now - record.state_timestamp <= retention {
                continue;
            }

            info!(log_id = %record.log_id, crashed_secs = now - record.state_timestamp, "Reaping crashed instance");
            self.ledger.release(&instance);
            self.droplets.remove_instance(&instance);
            if !self.config.disable_dir_cleanup {
                remove_dir_with_retries(&record.dir, &record.log_id).await;
            }
            reaped += 1;
        }

        if reaped > 0 {
            self.snapshots.schedule();
        }
        reaped
    }

    // =========================================================================
    // Evacuation and shutdown
    // =========================================================================

    /// Tells the platform every live instance is going away, without
    /// withdrawing routes, and stops admitting new ones.
    pub fn evacuate(&self) -> usize {
        info!("Evacuating instances");
        self.shutting_down.store(true, Ordering::Release);

        let mut evacuated = 0;
        for instance in self.droplets.instances() {
            if let Some(exited) = instance.evacuate() {
                debug!(log_id = %instance.log_id(), "Evacuating instance");
                publish_json(self.publisher.as_ref(), subjects::DROPLET_EXITED, &exited);
                evacuated += 1;
            }
        }

        self.snapshots.schedule();
        evacuated
    }

    /// Stops every instance and writes the final snapshot.
    pub async fn shutdown(self: &Arc<Self>) {
        info!(instances = self.droplets.instances().len(), "Shutting down");
        self.shutting_down.store(true, Ordering::Release);

        let instances = self.droplets.instances();
        for instance in &instances {
            instance.set_exit_reason(ExitReason::DeaShutdown);
        }
        join_all(instances.iter().map(|instance| self.stop_droplet(instance))).await;

        tokio::time::sleep(SHUTDOWN_SETTLE).await;
        match self.snapshots.snapshot_now().await {
            Ok(()) => info!("Shutdown complete"),
            Err(e) => error!(error = %e, "Failed to write final snapshot"),
        }
    }
}

/// Removes `dir`, retrying while files in it are still being released.
async fn remove_dir_with_retries(dir: &Path, log_id: &str) {
    let dir: PathBuf = dir.to_path_buf();
    for attempt in 1..=REMOVE_ATTEMPTS {
        let target = dir.clone();
        let result = tokio::task::spawn_blocking(move || match std::fs::remove_dir_all(&target) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!(log_id, dir = %dir.display(), "Removed instance directory");
                return;
            }
            Ok(Err(e)) if attempt < REMOVE_ATTEMPTS => {
                debug!(log_id, attempt, error = %e, "Retrying directory removal");
                tokio::time::sleep(REMOVE_RETRY_DELAY).await;
            }
            Ok(Err(e)) => {
                warn!(log_id, dir = %dir.display(), error = %e, "Failed to remove instance directory");
            }
            Err(e) => {
                warn!(log_id, error = %e, "Directory removal task failed");
                return;
            }
        }
    }
}
