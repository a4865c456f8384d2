//! Host capacity as reported in varz and instance stats.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cores: usize,
    /// KB.
    pub total_memory_kb: u64,
}

impl HostResources {
    pub fn measure() -> Self {
        Self {
            cores: cpu_count(),
            total_memory_kb: total_memory_kb(),
        }
    }
}

fn cpu_count() -> usize {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count > 0 {
        return count as usize;
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

fn total_memory_kb() -> u64 {
    if let Some(total) = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| parse_mem_total(&meminfo))
    {
        return total;
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size > 0 && pages > 0 {
        return (page_size as u64 * pages as u64) / 1024;
    }
    0
}

/// `MemTotal` from `/proc/meminfo`, in KB.
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("MemTotal:"), Some(value)) => value.parse().ok(),
            _ => None,
        }
    })
}
