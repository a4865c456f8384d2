//! The droplet execution agent.
//!
//! [`Agent`] owns the droplet collection, the resource ledger and the
//! snapshot store, and drives the collaborators:
//!
//! - `lifecycle`: admission, staging, launch, liveness, stop and cleanup
//! - `handlers`: bus subscriptions and the read-only query replies
//! - `monitoring`: the usage pass, quota enforcement and varz refresh
//!
//! Handlers never block the bus read loop; anything that waits is spawned
//! onto the runtime.

mod handlers;
mod lifecycle;
mod monitoring;

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dea_messages::{HelloMessage, RouterRegistration};
use tracing::{info, warn};

use crate::component::Component;
use crate::config::{Config, VERSION};
use crate::launcher::Launcher;
use crate::ledger::ResourceLedger;
use crate::model::{DropletCollection, DropletInstance, InstanceRecord};
use crate::monitor::{ProcessMonitor, UsageHistory};
use crate::publisher::{publish_json, Publisher};
use crate::resources::HostResources;
use crate::snapshot::SnapshotStore;
use crate::staging::Stager;

pub use lifecycle::{read_state_file_decl, STATE_FILE_DECL};
pub use monitoring::{Metrics, CPU_DEMOTION_THRESHOLD};

/// The pluggable side effects of the agent.
pub struct Collaborators {
    pub publisher: Arc<dyn Publisher>,
    pub stager: Arc<dyn Stager>,
    pub launcher: Arc<dyn Launcher>,
    pub processes: Arc<dyn ProcessMonitor>,
}

/// Where this agent can be reached.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// IP announced to routers and clients.
    pub host: String,
    /// Port of the droplet file viewer.
    pub file_port: u16,
}

pub struct Agent {
    config: Config,
    uuid: String,
    endpoint: Endpoint,
    file_credentials: Vec<String>,
    component: Arc<Component>,
    resources: HostResources,

    droplets: Arc<DropletCollection>,
    ledger: ResourceLedger,
    snapshots: Arc<SnapshotStore>,
    usage: UsageHistory,

    shutting_down: AtomicBool,
    recovered: AtomicBool,

    publisher: Arc<dyn Publisher>,
    stager: Arc<dyn Stager>,
    launcher: Arc<dyn Launcher>,
    processes: Arc<dyn ProcessMonitor>,
}

impl Agent {
    pub fn new(
        config: Config,
        endpoint: Endpoint,
        component: Arc<Component>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let droplets = Arc::new(DropletCollection::new());
        let snapshots = Arc::new(SnapshotStore::new(config.snapshot_path(), Arc::clone(&droplets)));
        let usage = UsageHistory::new(config.max_usage_samples());
        let (user, pass) = component.credentials();

        Arc::new(Self {
            uuid: component.uuid().to_string(),
            file_credentials: vec![user.to_string(), pass.to_string()],
            resources: HostResources::measure(),
            config,
            endpoint,
            component,
            droplets,
            ledger: ResourceLedger::new(),
            snapshots,
            usage,
            shutting_down: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            publisher: collaborators.publisher,
            stager: collaborators.stager,
            launcher: collaborators.launcher,
            processes: collaborators.processes,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The component uuid, used as the agent id on the bus.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    pub fn component(&self) -> &Arc<Component> {
        &self.component
    }

    pub fn droplets(&self) -> &Arc<DropletCollection> {
        &self.droplets
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn usage(&self) -> &UsageHistory {
        &self.usage
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Whether the snapshot has been loaded. Until then the file on disk is
    /// the only record of running instances and must not be overwritten.
    pub fn recovered(&self) -> bool {
        self.recovered.load(Ordering::Acquire)
    }

    pub fn hello(&self) -> HelloMessage {
        HelloMessage {
            id: self.uuid.clone(),
            ip: self.endpoint.host.clone(),
            port: self.endpoint.file_port,
            version: VERSION.to_string(),
        }
    }

    fn registration(&self, record: &InstanceRecord) -> RouterRegistration {
        record.router_registration(&self.uuid, &self.endpoint.host)
    }

    fn register_routes(&self, record: &InstanceRecord) {
        publish_json(
            self.publisher.as_ref(),
            dea_messages::subjects::ROUTER_REGISTER,
            &self.registration(record),
        );
    }

    fn unregister_routes(&self, record: &InstanceRecord) {
        publish_json(
            self.publisher.as_ref(),
            dea_messages::subjects::ROUTER_UNREGISTER,
            &self.registration(record),
        );
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Creates the working directories and reloads the previous run's
    /// instances. Returns how many were recovered.
    ///
    /// Recovered instances are orphaned until a monitoring pass confirms
    /// their process is alive, and hold a reservation from the start.
    pub fn recover(&self) -> Result<usize> {
        for dir in [self.config.apps_dir(), self.config.staged_dir(), self.config.db_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let document = self.snapshots.load().context("Failed to load snapshot")?;
        let mut recovered = 0;
        for record in document.into_iter().flatten().flat_map(|(_, instances)| instances.into_values()) {
            let record = InstanceRecord {
                orphaned: true,
                resources_tracked: false,
                stop_processed: false,
                ..record
            };
            info!(log_id = %record.log_id, state = %record.state, "Recovered instance");

            let instance = Arc::new(DropletInstance::new(record));
            self.ledger.track(&instance);
            self.droplets.add_instance(instance);
            recovered += 1;
        }

        if !self.config.disable_dir_cleanup {
            self.delete_untracked_dirs();
        }

        self.recovered.store(true, Ordering::Release);
        info!(recovered, droplets = self.droplets.droplet_count(), "Recovery complete");
        Ok(recovered)
    }

    /// Removes instance directories no known instance refers to.
    fn delete_untracked_dirs(&self) {
        let apps_dir = self.config.apps_dir();
        let known: HashSet<_> = self
            .droplets
            .instances()
            .iter()
            .map(|instance| instance.snapshot().dir)
            .collect();

        let entries = match fs::read_dir(&apps_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %apps_dir.display(), error = %e, "Failed to list instance directories");
                return;
            }
        };

        for path in entries.flatten().map(|entry| entry.path()) {
            if known.contains(&path) {
                continue;
            }
            info!(dir = %path.display(), "Removing untracked instance directory");
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!(dir = %path.display(), error = %e, "Failed to remove untracked directory");
            }
        }
    }

    /// Announces the agent and reconciles recovered instances against the
    /// process table before regular traffic is handled.
    pub async fn startup(self: &Arc<Self>) {
        publish_json(self.publisher.as_ref(), dea_messages::subjects::DEA_START, &self.hello());
        self.monitor_pass(true).await;
        self.send_heartbeat();
        if let Err(e) = self.snapshots.snapshot_now().await {
            warn!(error = %e, "Failed to write snapshot");
        }
        info!(uuid = %self.uuid, host = %self.endpoint.host, "Agent started");
    }
}
