//! Bounded polling used to detect when a launched instance is up.
//!
//! Three probes run against a starting instance:
//! - **state file**: the application writes `{"state": "RUNNING"}` to a file
//!   it declares in its manifest
//! - **port**: a TCP connect to the assigned port succeeds
//! - **pid file**: the launcher has written the child pid to `run.pid`
//!
//! Each probe is driven by a [`RetryPolicy`] as a timer on the async runtime.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

/// Connect timeout of a single port probe attempt.
pub const PORT_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Fixed-interval retry schedule. `attempts: None` never gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    #[serde(default)]
    pub attempts: Option<u32>,
}

/// Result of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Ready,
    Pending,
    /// The instance left the state the probe was waiting in.
    Abort,
}

/// Result of a whole probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    Aborted,
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub const STATE_FILE: Self = Self::new(500, 600);
    pub const PORT: Self = Self::new(500, 120);
    pub const PID_FILE: Self = Self::new(1000, 300);

    pub const fn new(interval_ms: u64, attempts: u32) -> Self {
        Self {
            interval_ms,
            attempts: Some(attempts),
        }
    }

    #[must_use]
    pub const fn unbounded(self) -> Self {
        Self {
            interval_ms: self.interval_ms,
            attempts: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Runs `check` until it reports ready or abort, or attempts run out.
    pub async fn run<F, Fut>(&self, mut check: F) -> ProbeOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Probe>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match check().await {
                Probe::Ready => return ProbeOutcome::Ready,
                Probe::Abort => return ProbeOutcome::Aborted,
                Probe::Pending => {}
            }

            if self.attempts.is_some_and(|max| attempt >= max) {
                return ProbeOutcome::Exhausted { attempts: attempt };
            }
            tokio::time::sleep(self.interval()).await;
        }
    }
}

/// Whether something accepts TCP connections on `host:port`.
pub async fn port_open(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Whether the application's state file reports `RUNNING`.
pub async fn state_file_running(path: &Path) -> bool {
    #[derive(Deserialize)]
    struct StateFile {
        state: Option<String>,
    }

    let Ok(content) = tokio::fs::read(path).await else {
        return false;
    };
    serde_json::from_slice::<StateFile>(&content)
        .ok()
        .and_then(|f| f.state)
        .is_some_and(|state| state == "RUNNING")
}

/// Reads a positive pid from a pid file.
pub async fn read_pid_file(path: &Path) -> Option<u32> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    content.trim().parse().ok().filter(|pid| *pid > 0)
}
