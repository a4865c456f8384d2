//! A single instance and its guarded state transitions.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dea_id::InstanceId;
use dea_messages::{DropletExited, DropletId, ExitReason, InstanceState, Usage};

use super::InstanceRecord;

/// Niceness ceiling for CPU demotion.
pub const MAX_NICE: i32 = 20;

/// One scheduled or running copy of a droplet.
///
/// The record sits behind a per-instance mutex and is only changed through
/// the transition methods below, each of which completes under one lock
/// acquisition. Readers get a clone via [`DropletInstance::snapshot`].
#[derive(Debug)]
pub struct DropletInstance {
    id: InstanceId,
    droplet_id: DropletId,
    record: Mutex<InstanceRecord>,
}

/// What the first (and only) stop of an instance has to do.
#[derive(Debug, Clone)]
pub struct StopTicket {
    /// The record after the stop transition.
    pub record: InstanceRecord,
    /// `droplet.exited` to publish, if not sent before.
    pub exited: Option<DropletExited>,
    /// Whether routes still need to be withdrawn.
    pub unregister: bool,
    /// Whether the process may still be alive.
    pub run_stop_hook: bool,
}

/// URIs added and removed by an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UriDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl DropletInstance {
    pub fn new(record: InstanceRecord) -> Self {
        Self {
            id: record.instance_id,
            droplet_id: record.droplet_id,
            record: Mutex::new(record),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn droplet_id(&self) -> DropletId {
        self.droplet_id
    }

    fn lock(&self) -> MutexGuard<'_, InstanceRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point-in-time copy of every attribute.
    pub fn snapshot(&self) -> InstanceRecord {
        self.lock().clone()
    }

    pub fn state(&self) -> InstanceState {
        self.lock().state
    }

    pub fn log_id(&self) -> String {
        self.lock().log_id.clone()
    }

    pub fn stop_processed(&self) -> bool {
        self.lock().stop_processed
    }

    // =========================================================================
    // Lifecycle transitions
    // =========================================================================

    /// STARTING → RUNNING. Returns the new record, or `None` if the instance
    /// had already left STARTING.
    pub fn mark_running(&self) -> Option<InstanceRecord> {
        let mut rec = self.lock();
        if rec.state != InstanceState::Starting {
            return None;
        }
        rec.set_state(InstanceState::Running);
        Some(rec.clone())
    }

    /// The process died, or never came up. No-op once stop has run.
    pub fn mark_crashed(&self) -> bool {
        let mut rec = self.lock();
        if rec.stop_processed {
            return false;
        }
        rec.exit_reason = Some(ExitReason::Crashed);
        rec.set_state(InstanceState::Crashed);
        rec.pid = 0;
        true
    }

    /// A resource limit was exceeded. Like [`mark_crashed`](Self::mark_crashed)
    /// but keeps the pid so the stop hook can still kill the process.
    pub fn mark_limit_exceeded(&self) -> bool {
        let mut rec = self.lock();
        if rec.stop_processed {
            return false;
        }
        rec.exit_reason = Some(ExitReason::Crashed);
        rec.set_state(InstanceState::Crashed);
        true
    }

    /// Sets the reason for an upcoming stop of a STARTING or RUNNING
    /// instance. The first reason wins.
    pub fn set_exit_reason(&self, reason: ExitReason) -> bool {
        let mut rec = self.lock();
        if !rec.state.is_active() || rec.exit_reason.is_some() {
            return false;
        }
        rec.exit_reason = Some(reason);
        true
    }

    /// CRASHED → DELETED, re-arming stop so cleanup removes the instance.
    pub fn mark_deleted(&self) -> bool {
        let mut rec = self.lock();
        if rec.state != InstanceState::Crashed {
            return false;
        }
        rec.set_state(InstanceState::Deleted);
        rec.stop_processed = false;
        true
    }

    /// Runs the stop transition once. Every later call returns `None`.
    ///
    /// An instance stopped without a reason is considered crashed. Active
    /// instances move to STOPPED after the exit notification is composed,
    /// so the notification carries the state the instance ended in.
    pub fn begin_stop(&self) -> Option<StopTicket> {
        let mut rec = self.lock();
        if rec.stop_processed {
            return None;
        }
        rec.stop_processed = true;

        let was_active = rec.state.is_active();
        let unregister = !rec.notified || rec.evacuated;
        let mut exited = None;
        if !rec.notified {
            if rec.exit_reason.is_none() {
                rec.exit_reason = Some(ExitReason::Crashed);
                rec.set_state(InstanceState::Crashed);
            }
            exited = Some(rec.exited_message());
            rec.notified = true;
        }

        if rec.state.is_active() {
            rec.set_state(InstanceState::Stopped);
        }

        Some(StopTicket {
            record: rec.clone(),
            exited,
            unregister,
            run_stop_hook: was_active || rec.pid != 0,
        })
    }

    /// Marks a non-crashed instance as evacuated and returns the exit
    /// notification to send, unless one was already sent.
    pub fn evacuate(&self) -> Option<DropletExited> {
        let mut rec = self.lock();
        if rec.state == InstanceState::Crashed || rec.notified {
            return None;
        }
        rec.exit_reason = Some(ExitReason::DeaEvacuation);
        rec.notified = true;
        rec.evacuated = true;
        Some(rec.exited_message())
    }

    // =========================================================================
    // Attribute updates
    // =========================================================================

    /// Records the process id, unless the instance is already being stopped.
    pub fn set_pid(&self, pid: u32) -> bool {
        let mut rec = self.lock();
        if rec.stop_processed {
            return false;
        }
        rec.pid = pid;
        true
    }

    /// Forgets the process id if it is still `pid`. A pid recorded after
    /// `pid` was observed is kept.
    pub fn clear_pid_if(&self, pid: u32) -> bool {
        let mut rec = self.lock();
        if pid == 0 || rec.pid != pid {
            return false;
        }
        rec.pid = 0;
        true
    }

    pub fn assign_ports(&self, port: u16, debug: Option<(String, u16)>) {
        let mut rec = self.lock();
        rec.port = port;
        if let Some((ip, debug_port)) = debug {
            rec.debug_ip = Some(ip);
            rec.debug_port = Some(debug_port);
        }
    }

    pub fn set_state_file(&self, state_file: Option<String>) {
        self.lock().state_file = state_file;
    }

    /// Replaces the URI set, returning what changed.
    pub fn set_uris(&self, uris: Vec<String>) -> (UriDelta, InstanceRecord) {
        let mut rec = self.lock();
        let old: BTreeSet<&String> = rec.uris.iter().collect();
        let new: BTreeSet<&String> = uris.iter().collect();

        let delta = UriDelta {
            added: new.difference(&old).map(|u| (*u).clone()).collect(),
            removed: old.difference(&new).map(|u| (*u).clone()).collect(),
        };
        rec.uris = uris;
        (delta, rec.clone())
    }

    pub fn record_usage(&self, usage: Usage) {
        self.lock().usage = Some(usage);
    }

    /// Raises niceness by one, returning the new value, until [`MAX_NICE`].
    pub fn demote(&self) -> Option<i32> {
        let mut rec = self.lock();
        if rec.nice >= MAX_NICE {
            return None;
        }
        rec.nice += 1;
        Some(rec.nice)
    }

    /// Flips the resource accounting flag. Returns the memory quota in MB
    /// when the flag changed, `None` when it already had that value.
    pub(crate) fn set_resources_tracked(&self, tracked: bool) -> Option<u64> {
        let mut rec = self.lock();
        if rec.resources_tracked == tracked {
            return None;
        }
        rec.resources_tracked = tracked;
        Some(rec.mem_quota_mb())
    }
}
