//! Process and disk sampling.
//!
//! - [`ProcessMonitor`]: the collaborator the monitoring pass polls
//! - [`ProcTable`]: reads `/proc` and walks instance directories
//! - [`UsageHistory`]: bounded per-pid sample history
//! - [`MockProcessMonitor`]: scripted samples, for tests

mod process;
mod usage;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use process::ProcTable;
pub use usage::UsageHistory;

/// Resource usage of one process at the time of a poll.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    /// Percent of one core since the previous poll.
    pub cpu: f64,
    /// Resident set size in KB.
    pub rss_kb: u64,
}

/// Source of process and disk usage.
pub trait ProcessMonitor: Send + Sync {
    /// Every live process by pid.
    fn processes(&self) -> HashMap<u32, ProcessSample>;

    /// Bytes used below `dir`.
    fn disk_usage(&self, dir: &Path) -> u64;

    /// Sets the scheduling priority of `pid`.
    fn renice(&self, pid: u32, nice: i32) -> io::Result<()>;
}

#[derive(Default)]
struct MockState {
    processes: HashMap<u32, ProcessSample>,
    disk: HashMap<PathBuf, u64>,
    renices: Vec<(u32, i32)>,
}

/// Process monitor returning whatever the test put in.
#[derive(Default)]
pub struct MockProcessMonitor {
    state: Mutex<MockState>,
}

impl MockProcessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_process(&self, pid: u32, cpu: f64, rss_kb: u64) {
        self.lock().processes.insert(pid, ProcessSample { cpu, rss_kb });
    }

    pub fn remove_process(&self, pid: u32) {
        self.lock().processes.remove(&pid);
    }

    pub fn set_disk_usage(&self, dir: impl Into<PathBuf>, bytes: u64) {
        self.lock().disk.insert(dir.into(), bytes);
    }

    pub fn renices(&self) -> Vec<(u32, i32)> {
        self.lock().renices.clone()
    }
}

impl ProcessMonitor for MockProcessMonitor {
    fn processes(&self) -> HashMap<u32, ProcessSample> {
        self.lock().processes.clone()
    }

    fn disk_usage(&self, dir: &Path) -> u64 {
        self.lock().disk.get(dir).copied().unwrap_or(0)
    }

    fn renice(&self, pid: u32, nice: i32) -> io::Result<()> {
        self.lock().renices.push((pid, nice));
        Ok(())
    }
}
