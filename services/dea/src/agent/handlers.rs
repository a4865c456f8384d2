//! Bus subscriptions and the handlers behind them.

use std::sync::Arc;
use std::time::Duration;

use dea_bus::{Message, SubscribeOptions};
use dea_messages::{
    subjects, DiscoverRequest, ExitReason, FindDropletReply, FindDropletRequest, Heartbeat,
    InstanceState, StatusReply, StopRequest, UpdateRequest,
};
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::Agent;
use crate::config::VERSION;
use crate::publisher::publish_json;

/// Discovery reply delay per instance of the droplet already running here.
const TAINT_MS_PER_APP: f64 = 10.0;
/// Discovery reply delay at full memory reservation.
const TAINT_MS_FOR_MEM: f64 = 100.0;
const TAINT_MAX_DELAY_MS: f64 = 250.0;

fn decode<T: DeserializeOwned>(subject: &str, payload: &[u8]) -> Option<T> {
    match dea_messages::decode(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(subject, error = %e, "Ignoring malformed message");
            None
        }
    }
}

impl Agent {
    fn on(self: &Arc<Self>, client: &dea_bus::Client, subject: &str, handler: fn(&Arc<Agent>, Message)) {
        let agent = Arc::clone(self);
        client.subscribe(subject, SubscribeOptions::default(), move |msg| handler(&agent, msg));
    }

    /// Subscribes every handler on `client`.
    pub fn subscribe(self: &Arc<Self>, client: &dea_bus::Client) {
        self.on(client, subjects::DEA_STATUS, |agent, msg| {
            if let Some(reply) = msg.reply.as_deref() {
                agent.handle_status(reply);
            }
        });
        self.on(client, subjects::DROPLET_STATUS, |agent, msg| {
            if let Some(reply) = msg.reply.as_deref() {
                agent.handle_droplet_status(reply);
            }
        });
        self.on(client, subjects::DEA_DISCOVER, |agent, msg| {
            if let Some(reply) = msg.reply.as_deref() {
                agent.handle_discover(reply, &msg.payload);
            }
        });
        self.on(client, subjects::DEA_FIND_DROPLET, |agent, msg| {
            if let Some(reply) = msg.reply.as_deref() {
                agent.handle_find_droplet(reply, &msg.payload);
            }
        });
        self.on(client, subjects::DEA_UPDATE, |agent, msg| agent.handle_update(&msg.payload));
        self.on(client, subjects::DEA_STOP, |agent, msg| {
            let agent = Arc::clone(agent);
            tokio::spawn(async move { agent.handle_stop(&msg.payload).await });
        });
        self.on(client, &subjects::dea_instance_start(&self.uuid), |agent, msg| {
            agent.on_start(&msg.payload);
        });
        self.on(client, subjects::ROUTER_START, |agent, _| agent.handle_router_start());
        self.on(client, subjects::HEALTHMANAGER_START, |agent, _| agent.send_heartbeat());

        info!(uuid = %self.uuid, subscriptions = client.subscription_count(), "Subscribed to the bus");
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn status(&self) -> StatusReply {
        let counters = self.ledger.counters();
        StatusReply {
            id: self.uuid.clone(),
            ip: self.endpoint.host.clone(),
            port: self.endpoint.file_port,
            version: VERSION.to_string(),
            max_memory: self.config.max_memory,
            reserved_memory: counters.reserved_mem,
            used_memory: counters.used_mem,
            num_clients: counters.num_clients,
            state: self.is_shutting_down().then(|| "SHUTTING_DOWN".to_string()),
        }
    }

    pub fn handle_status(&self, reply: &str) {
        publish_json(self.publisher.as_ref(), reply, &self.status());
    }

    /// One reply per RUNNING instance.
    pub fn handle_droplet_status(&self, reply: &str) {
        for instance in self.droplets.instances() {
            let record = instance.snapshot();
            if record.state == InstanceState::Running {
                publish_json(self.publisher.as_ref(), reply, &record.status(self.host(), None));
            }
        }
    }

    /// How long to hold back a discovery reply for `droplet`, so that busy
    /// agents answer last.
    pub fn taint_delay(&self, droplet: dea_messages::DropletId) -> Duration {
        let instances = self.droplets.instance_count(droplet) as f64;
        let reserved = self.ledger.counters().reserved_mem as f64;
        let pressure = if self.config.max_memory == 0 {
            1.0
        } else {
            reserved / self.config.max_memory as f64
        };

        let taint = instances * TAINT_MS_PER_APP + pressure * TAINT_MS_FOR_MEM;
        Duration::from_millis(taint.max(1.0).min(TAINT_MAX_DELAY_MS) as u64)
    }

    /// Answers with the hello message after the taint delay, if an instance
    /// of the requested size would be admitted.
    pub fn handle_discover(&self, reply: &str, payload: &[u8]) {
        let Some(request) = decode::<DiscoverRequest>(subjects::DEA_DISCOVER, payload) else {
            return;
        };
        if self.is_shutting_down() {
            debug!("Ignoring discovery while shutting down");
            return;
        }
        if self.config.runtime(&request.runtime).is_none() {
            debug!(runtime = %request.runtime, "Ignoring discovery for unsupported runtime");
            return;
        }
        if let Err(e) = self.ledger.can_admit(
            request.limits.mem_mb(),
            self.config.max_memory,
            self.config.max_clients(),
        ) {
            debug!(droplet = request.droplet, reason = %e, "Ignoring discovery");
            return;
        }

        let delay = self.taint_delay(request.droplet);
        let publisher = Arc::clone(&self.publisher);
        let hello = self.hello();
        let reply = reply.to_string();
        debug!(droplet = request.droplet, delay_ms = delay.as_millis() as u64, "Answering discovery");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            publish_json(publisher.as_ref(), &reply, &hello);
        });
    }

    /// One reply per instance matching the filter.
    pub fn handle_find_droplet(&self, reply: &str, payload: &[u8]) {
        let Some(request) = decode::<FindDropletRequest>(subjects::DEA_FIND_DROPLET, payload) else {
            return;
        };
        let filter = &request.filter;
        let file_uri = format!("http://{}:{}/droplets/", self.endpoint.host, self.endpoint.file_port);

        for instance in self.droplets.droplet_instances(filter.droplet) {
            let record = instance.snapshot();
            if !filter.matches(
                record.droplet_id,
                &record.version,
                &record.instance_id,
                record.instance_index,
                record.state,
            ) {
                continue;
            }

            let stats = (request.include_stats && record.state == InstanceState::Running)
                .then(|| record.status(self.host(), u32::try_from(self.resources.cores).ok()));
            let response = FindDropletReply {
                dea: self.uuid.clone(),
                version: record.version.clone(),
                droplet: record.droplet_id,
                instance: record.instance_id,
                index: record.instance_index,
                state: record.state,
                state_timestamp: record.state_timestamp,
                file_uri: file_uri.clone(),
                credentials: self.file_credentials.clone(),
                staged: record.staged.clone(),
                debug_ip: record.debug_ip.clone(),
                debug_port: record.debug_port,
                stats,
            };
            publish_json(self.publisher.as_ref(), reply, &response);
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Replaces the URIs of every instance of a droplet. Running instances
    /// get their route changes published.
    pub fn handle_update(&self, payload: &[u8]) {
        let Some(request) = decode::<UpdateRequest>(subjects::DEA_UPDATE, payload) else {
            return;
        };

        for instance in self.droplets.droplet_instances(request.droplet) {
            let (delta, record) = instance.set_uris(request.uris.clone());
            info!(log_id = %record.log_id, added = ?delta.added, removed = ?delta.removed, "Updating URIs");
            if record.state != InstanceState::Running {
                continue;
            }

            if !delta.added.is_empty() {
                let mut registration = self.registration(&record);
                registration.uris = delta.added;
                publish_json(self.publisher.as_ref(), subjects::ROUTER_REGISTER, &registration);
            }
            if !delta.removed.is_empty() {
                let mut registration = self.registration(&record);
                registration.uris = delta.removed;
                publish_json(self.publisher.as_ref(), subjects::ROUTER_UNREGISTER, &registration);
            }
        }
        self.snapshots.schedule();
    }

    /// Stops every matching instance. Crashed ones are deleted.
    pub async fn handle_stop(self: &Arc<Self>, payload: &[u8]) {
        let Some(request) = decode::<StopRequest>(subjects::DEA_STOP, payload) else {
            return;
        };
        let filter = &request.filter;

        let targets: Vec<_> = self
            .droplets
            .droplet_instances(filter.droplet)
            .into_iter()
            .filter(|instance| {
                let record = instance.snapshot();
                filter.matches(
                    record.droplet_id,
                    &record.version,
                    &record.instance_id,
                    record.instance_index,
                    record.state,
                )
            })
            .collect();

        for instance in &targets {
            match instance.state() {
                InstanceState::Crashed => {
                    instance.mark_deleted();
                }
                _ => {
                    instance.set_exit_reason(ExitReason::Stopped);
                }
            }
        }
        debug!(droplet = filter.droplet, instances = targets.len(), "Stopping instances");
        join_all(targets.iter().map(|instance| self.stop_droplet(instance))).await;
    }

    /// Re-registers every running instance with the router.
    pub fn handle_router_start(&self) {
        for instance in self.droplets.instances() {
            let record = instance.snapshot();
            if record.state == InstanceState::Running {
                self.register_routes(&record);
            }
        }
    }

    /// Publishes the state of every instance. Nothing is sent while there
    /// are no instances.
    pub fn send_heartbeat(&self) {
        let droplets: Vec<_> = self
            .droplets
            .instances()
            .iter()
            .map(|instance| instance.snapshot().heartbeat())
            .collect();
        if droplets.is_empty() {
            return;
        }
        publish_json(self.publisher.as_ref(), subjects::DEA_HEARTBEAT, &Heartbeat { droplets });
    }
}
