//! Bounded usage history per process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use dea_messages::Usage;

/// Keeps the last `capacity` samples of every monitored pid.
#[derive(Debug)]
pub struct UsageHistory {
    capacity: usize,
    samples: Mutex<HashMap<u32, VecDeque<Usage>>>,
}

impl UsageHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a sample, evicting the oldest one at capacity.
    pub fn record(&self, pid: u32, usage: Usage) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let history = samples.entry(pid).or_default();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(usage);
    }

    pub fn remove(&self, pid: u32) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    /// Drops the history of every pid not in `live`.
    pub fn retain(&self, live: impl Fn(u32) -> bool) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|pid, _| live(*pid));
    }

    /// Samples of `pid`, oldest first.
    pub fn samples(&self, pid: u32) -> Vec<Usage> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracked_pids(&self) -> usize {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn sample(mem: u64) -> Usage {
        Usage {
            time: Utc::now(),
            cpu: 0.0,
            mem,
            disk: 0,
        }
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let history = UsageHistory::new(3);
        for mem in 1..=5 {
            history.record(42, sample(mem));
        }

        let mems: Vec<u64> = history.samples(42).iter().map(|u| u.mem).collect();
        assert_eq!(mems, vec![3, 4, 5]);
    }

    #[test]
    fn test_remove() {
        let history = UsageHistory::new(3);
        history.record(1, sample(1));
        history.record(2, sample(1));
        history.remove(1);

        assert!(history.samples(1).is_empty());
        assert_eq!(history.tracked_pids(), 1);
    }

    #[test]
    fn test_retain_live_pids() {
        let history = UsageHistory::new(3);
        for pid in 1..=4 {
            history.record(pid, sample(1));
        }
        history.retain(|pid| pid % 2 == 0);

        assert_eq!(history.tracked_pids(), 2);
        assert!(history.samples(1).is_empty());
        assert_eq!(history.samples(4).len(), 1);
    }
}
