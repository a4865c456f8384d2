//! `/proc` backed process monitor.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use walkdir::WalkDir;

use super::{ProcessMonitor, ProcessSample};

/// CPU ticks of one process and when they were read.
#[derive(Debug, Clone, Copy)]
struct Ticks {
    total: u64,
    at: Instant,
}

/// Reads the kernel process table.
pub struct ProcTable {
    root: PathBuf,
    clock_ticks: f64,
    page_kb: u64,
    previous: Mutex<HashMap<u32, Ticks>>,
}

impl ProcTable {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            root: root.into(),
            clock_ticks: if clock_ticks > 0 { clock_ticks as f64 } else { 100.0 },
            page_kb: if page_size > 0 { page_size as u64 / 1024 } else { 4 },
            previous: Mutex::new(HashMap::new()),
        }
    }

    fn cpu_percent(&self, previous: Option<Ticks>, now: Ticks) -> f64 {
        let Some(previous) = previous else {
            return 0.0;
        };
        let elapsed = now.at.duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let cpu_secs = now.total.saturating_sub(previous.total) as f64 / self.clock_ticks;
        cpu_secs / elapsed * 100.0
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed fields of `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatLine {
    pub ticks: u64,
    pub rss_pages: u64,
}

/// Parses a stat line. Fields are counted after the command name, which is
/// parenthesised and may itself contain spaces or parentheses.
pub(crate) fn parse_stat(line: &str) -> Option<StatLine> {
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3 of the full line).
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss_pages: u64 = fields.get(21)?.parse().ok()?;
    Some(StatLine {
        ticks: utime + stime,
        rss_pages,
    })
}

impl ProcessMonitor for ProcTable {
    fn processes(&self) -> HashMap<u32, ProcessSample> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return HashMap::new();
        };

        let now = Instant::now();
        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        let mut current = HashMap::new();
        let mut samples = HashMap::new();

        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Some(stat) = fs::read_to_string(entry.path().join("stat"))
                .ok()
                .and_then(|line| parse_stat(&line))
            else {
                continue;
            };

            let ticks = Ticks {
                total: stat.ticks,
                at: now,
            };
            samples.insert(
                pid,
                ProcessSample {
                    cpu: self.cpu_percent(previous.get(&pid).copied(), ticks),
                    rss_kb: stat.rss_pages * self.page_kb,
                },
            );
            current.insert(pid, ticks);
        }

        *previous = current;
        samples
    }

    fn disk_usage(&self, dir: &Path) -> u64 {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    fn renice(&self, pid: u32, nice: i32) -> io::Result<()> {
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const STAT: &str = "4242 (ruby (worker) x) S 1 4242 4242 0 -1 4194560 1300 0 0 0 \
                        150 50 0 0 20 0 2 0 12345 123456789 2048 18446744073709551615";

    #[test]
    fn test_parse_stat() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.ticks, 200);
        assert_eq!(stat.rss_pages, 2048);

        assert!(parse_stat("4242 (short) S 1").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_reads_fake_proc() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("4242")).unwrap();
        fs::write(root.path().join("4242/stat"), STAT).unwrap();
        fs::create_dir_all(root.path().join("self")).unwrap();

        let table = ProcTable::with_root(root.path());
        let processes = table.processes();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[&4242].rss_kb, 2048 * table.page_kb);
        assert_eq!(processes[&4242].cpu, 0.0);
    }

    #[test]
    fn test_cpu_percent_from_tick_delta() {
        let table = ProcTable::with_root("/nonexistent");
        let start = Instant::now();
        let before = Ticks { total: 100, at: start };
        let after = Ticks {
            total: 100 + table.clock_ticks as u64,
            at: start + Duration::from_secs(2),
        };
        assert!((table.cpu_percent(Some(before), after) - 50.0).abs() < 0.001);
        assert_eq!(table.cpu_percent(None, after), 0.0);
    }

    #[test]
    fn test_disk_usage() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app/logs")).unwrap();
        fs::write(dir.path().join("app/startup"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("app/logs/stdout.log"), vec![0u8; 28]).unwrap();

        let table = ProcTable::with_root("/nonexistent");
        assert_eq!(table.disk_usage(dir.path()), 128);
        assert_eq!(table.disk_usage(&dir.path().join("missing")), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sees_own_process() {
        let table = ProcTable::new();
        assert!(table.processes().contains_key(&std::process::id()));
    }
}
