//! Node-wide resource accounting.
//!
//! The ledger holds the reserved memory, the number of admitted clients and
//! the last measured memory usage. Reservations are tied to an instance's
//! `resources_tracked` flag, so each instance is counted at most once no
//! matter how many paths try to reserve or release it.
//!
//! Lock order is ledger first, then instance.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::model::DropletInstance;

/// Why a start request was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("insufficient memory: {requested} MB requested, {reserved} of {max} MB reserved")]
    InsufficientMemory { requested: u64, reserved: u64, max: u64 },

    #[error("too many clients: {clients} of {max}")]
    TooManyClients { clients: u64, max: u64 },

    #[error("agent is shutting down")]
    ShuttingDown,

    #[error("start request has no droplet bits source")]
    MissingBitsSource,

    #[error("unsupported runtime: {0}")]
    UnsupportedRuntime(String),
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounters {
    /// MB.
    pub reserved_mem: u64,
    pub num_clients: u64,
    /// KB.
    pub used_mem: u64,
}

#[derive(Debug, Default)]
pub struct ResourceLedger {
    counters: Mutex<LedgerCounters>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counters(&self) -> LedgerCounters {
        *self.lock()
    }

    /// Whether an instance needing `mem_mb` would currently be admitted.
    pub fn can_admit(&self, mem_mb: u64, max_memory: u64, max_clients: u64) -> Result<(), AdmissionError> {
        check(&self.lock(), mem_mb, max_memory, max_clients)
    }

    /// Checks the ceilings and reserves the instance's memory in one step.
    pub fn try_reserve(
        &self,
        instance: &DropletInstance,
        max_memory: u64,
        max_clients: u64,
    ) -> Result<(), AdmissionError> {
        let mut counters = self.lock();
        let mem_mb = instance.snapshot().mem_quota_mb();
        check(&counters, mem_mb, max_memory, max_clients)?;

        if let Some(mem_mb) = instance.set_resources_tracked(true) {
            counters.reserved_mem += mem_mb;
            counters.num_clients += 1;
        }
        Ok(())
    }

    /// Reserves unconditionally. Used for instances recovered from a snapshot,
    /// which were admitted by a previous run.
    pub fn track(&self, instance: &DropletInstance) {
        let mut counters = self.lock();
        if let Some(mem_mb) = instance.set_resources_tracked(true) {
            counters.reserved_mem += mem_mb;
            counters.num_clients += 1;
        }
    }

    /// Undoes the reservation of `instance`, if it holds one.
    pub fn release(&self, instance: &DropletInstance) -> bool {
        let mut counters = self.lock();
        let Some(mem_mb) = instance.set_resources_tracked(false) else {
            return false;
        };
        counters.reserved_mem = counters.reserved_mem.saturating_sub(mem_mb);
        counters.num_clients = counters.num_clients.saturating_sub(1);
        true
    }

    /// Records the memory measured by the last monitoring pass.
    pub fn set_used_mem(&self, used_kb: u64) {
        self.lock().used_mem = used_kb;
    }
}

fn check(
    counters: &LedgerCounters,
    mem_mb: u64,
    max_memory: u64,
    max_clients: u64,
) -> Result<(), AdmissionError> {
    if counters.reserved_mem + mem_mb > max_memory {
        return Err(AdmissionError::InsufficientMemory {
            requested: mem_mb,
            reserved: counters.reserved_mem,
            max: max_memory,
        });
    }
    if counters.num_clients >= max_clients {
        return Err(AdmissionError::TooManyClients {
            clients: counters.num_clients,
            max: max_clients,
        });
    }
    Ok(())
}
