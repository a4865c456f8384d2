//! The monitoring pass and the varz counters.
//!
//! Each pass samples the process table once, attributes usage to every
//! instance with a live pid and then:
//!
//! - enforces memory and disk quotas and demotes CPU hogs (secure mode)
//! - stops orphaned instances whose process is gone
//! - re-registers orphaned instances that survived a restart and resumes
//!   readiness detection for those that were still starting (startup pass)
//! - aggregates usage by framework and runtime into varz

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use dea_messages::{InstanceState, Usage};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::Agent;
use crate::model::{DropletInstance, InstanceRecord};

/// CPU percentage above which an instance is reniced.
pub const CPU_DEMOTION_THRESHOLD: f64 = 50.0;

/// Usage of the running instances of one framework or runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    /// KB.
    pub used_memory: u64,
    /// MB.
    pub reserved_memory: u64,
    /// Bytes.
    pub used_disk: u64,
    pub used_cpu: f64,
}

impl Metrics {
    fn add(&mut self, record: &InstanceRecord, usage: &Usage) {
        self.used_memory += usage.mem;
        self.reserved_memory += record.mem_quota_mb();
        self.used_disk += usage.disk;
        self.used_cpu += usage.cpu;
    }
}

enum Observation {
    Alive { pid: u32, usage: Usage },
    /// `pid` was recorded before the process table was read and is not in it.
    Gone { pid: u32 },
}

impl Agent {
    /// Samples every instance. Blocking: walks instance directories.
    ///
    /// Pids are read before the process table, so a pid recorded while the
    /// table is read is left for the next pass instead of being judged gone.
    fn observe(&self) -> Vec<(Arc<DropletInstance>, Observation)> {
        let known: Vec<_> = self
            .droplets
            .instances()
            .into_iter()
            .map(|instance| {
                let record = instance.snapshot();
                (instance, record.pid, record.dir)
            })
            .collect();
        let processes = self.processes.processes();

        known
            .into_iter()
            .map(|(instance, pid, dir)| {
                let observation = match processes.get(&pid) {
                    Some(sample) if pid != 0 => Observation::Alive {
                        pid,
                        usage: Usage {
                            time: Utc::now(),
                            cpu: sample.cpu,
                            mem: sample.rss_kb,
                            disk: self.processes.disk_usage(&dir),
                        },
                    },
                    _ => Observation::Gone { pid },
                };
                (instance, observation)
            })
            .collect()
    }

    /// Runs one monitoring pass. The startup pass also restores the routes
    /// of recovered instances that are still alive.
    pub async fn monitor_pass(self: &Arc<Self>, startup: bool) {
        let agent = Arc::clone(self);
        let observed = match tokio::task::spawn_blocking(move || agent.observe()).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(error = %e, "Monitoring pass failed");
                return;
            }
        };

        let mut used_mem_kb = 0;
        let mut live_pids = HashSet::new();
        let mut frameworks: BTreeMap<String, Metrics> = BTreeMap::new();
        let mut runtimes: BTreeMap<String, Metrics> = BTreeMap::new();
        let mut running_apps = Vec::new();

        for (instance, observation) in observed {
            let record = instance.snapshot();
            let (pid, usage) = match observation {
                Observation::Alive { pid, usage } => (pid, usage),
                Observation::Gone { pid } => {
                    if instance.clear_pid_if(pid) {
                        debug!(log_id = %record.log_id, pid, "Instance process is gone");
                    }
                    if record.orphaned && !record.stop_processed {
                        info!(log_id = %record.log_id, "Recovered instance is no longer running");
                        self.stop_droplet(&instance).await;
                    }
                    continue;
                }
            };

            live_pids.insert(pid);
            used_mem_kb += usage.mem;
            instance.record_usage(usage.clone());
            self.usage.record(pid, usage.clone());

            if self.config.secure && self.enforce_limits(&instance, &record, pid, &usage).await {
                continue;
            }
            if startup && record.orphaned {
                match record.state {
                    InstanceState::Running => {
                        info!(log_id = %record.log_id, pid, "Recovered instance is alive, restoring routes");
                        self.register_routes(&record);
                    }
                    InstanceState::Starting => {
                        info!(log_id = %record.log_id, pid, "Recovered instance is still starting");
                        let agent = Arc::clone(self);
                        let instance = Arc::clone(&instance);
                        tokio::spawn(async move { agent.detect_app_ready(&instance).await });
                    }
                    _ => {}
                }
            }

            if record.state == InstanceState::Running {
                frameworks.entry(record.framework.clone()).or_default().add(&record, &usage);
                runtimes.entry(record.runtime.clone()).or_default().add(&record, &usage);
                running_apps.push(json!({
                    "name": record.name,
                    "droplet": record.droplet_id,
                    "instance": record.instance_id,
                    "index": record.instance_index,
                    "uris": record.uris,
                    "usage": usage,
                }));
            }
        }

        self.ledger.set_used_mem(used_mem_kb);
        self.usage.retain(|pid| live_pids.contains(&pid));

        self.component.set_varz("frameworks", json!(frameworks));
        self.component.set_varz("runtimes", json!(runtimes));
        self.component.set_varz("running_apps", Value::Array(running_apps));
        self.component.set_varz("apps_used_memory", json!(used_mem_kb / 1024));
    }

    /// Stops an instance over its memory or disk quota and demotes one using
    /// too much CPU. Returns whether the instance was stopped.
    async fn enforce_limits(
        self: &Arc<Self>,
        instance: &Arc<DropletInstance>,
        record: &InstanceRecord,
        pid: u32,
        usage: &Usage,
    ) -> bool {
        let mem_quota_kb = record.mem_quota / 1024;
        let mut violations = Vec::new();
        if usage.mem > mem_quota_kb {
            violations.push(format!("Memory limit of {}M exceeded.", mem_quota_kb / 1024));
            violations.push(format!("Actual usage was {}M, process terminated.", usage.mem / 1024));
        }
        if usage.disk > record.disk_quota {
            violations.push(format!("Disk usage limit of {}M exceeded.", record.disk_quota / (1024 * 1024)));
            violations.push(format!(
                "Actual usage was {}M, process terminated.",
                usage.disk / (1024 * 1024)
            ));
        }

        if !violations.is_empty() {
            error!(
                log_id = %record.log_id,
                mem_kb = usage.mem,
                disk = usage.disk,
                "{}",
                violations.join(" ")
            );
            if let Err(e) = append_fatal_log(&record.dir, &violations).await {
                warn!(log_id = %record.log_id, error = %e, "Failed to write error log");
            }
            if instance.mark_limit_exceeded() {
                self.stop_droplet(instance).await;
            }
            return true;
        }

        if usage.cpu > CPU_DEMOTION_THRESHOLD {
            if let Some(nice) = instance.demote() {
                info!(log_id = %record.log_id, cpu = usage.cpu, nice, "Lowering instance priority");
                if let Err(e) = self.processes.renice(pid, nice) {
                    warn!(log_id = %record.log_id, pid, error = %e, "Failed to renice instance");
                }
            }
        }
        false
    }

    /// Publishes the node counters into varz.
    pub fn update_varz(&self) {
        let counters = self.ledger.counters();
        let component = &self.component;
        component.set_varz("max_memory", json!(self.config.max_memory));
        component.set_varz("reserved_memory", json!(counters.reserved_mem));
        component.set_varz("used_memory", json!(counters.used_mem));
        component.set_varz("num_clients", json!(counters.num_clients));
        component.set_varz("num_apps", json!(self.droplets.instances().len()));
        component.set_varz("mem", json!(self.resources.total_memory_kb));
        if self.is_shutting_down() {
            component.set_varz("state", json!("SHUTTING_DOWN"));
        }
    }

    /// Logs the whole droplet collection.
    pub fn dump_droplets(&self) {
        match serde_json::to_string(&self.droplets.to_document()) {
            Ok(document) => info!(droplets = %document, "Droplet collection"),
            Err(e) => warn!(error = %e, "Failed to serialize droplet collection"),
        }
    }
}

/// Appends `FATAL:` lines to the instance's private error log.
async fn append_fatal_log(dir: &Path, lines: &[String]) -> std::io::Result<()> {
    let logs = dir.join("logs");
    tokio::fs::create_dir_all(&logs).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs.join("err.log"))
        .await?;
    for line in lines {
        file.write_all(format!("FATAL: {line}\n").as_bytes()).await?;
    }
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::fixtures::record;

    #[test]
    fn test_metrics_accumulate() {
        let rec = record(1, 0);
        let usage = Usage {
            time: Utc::now(),
            cpu: 12.5,
            mem: 2048,
            disk: 4096,
        };

        let mut metrics = Metrics::default();
        metrics.add(&rec, &usage);
        metrics.add(&rec, &usage);
        assert_eq!(
            metrics,
            Metrics {
                used_memory: 4096,
                reserved_memory: 128,
                used_disk: 8192,
                used_cpu: 25.0,
            }
        );
    }

    #[tokio::test]
    async fn test_fatal_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        append_fatal_log(dir.path(), &["first".to_string()]).await.unwrap();
        append_fatal_log(dir.path(), &["second".to_string()]).await.unwrap();

        let log = std::fs::read_to_string(dir.path().join("logs/err.log")).unwrap();
        assert_eq!(log, "FATAL: first\nFATAL: second\n");
    }
}
