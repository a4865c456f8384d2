//! Droplet staging: getting an application's bits onto local disk.
//!
//! - [`Stager`]: the collaborator the lifecycle calls before launching
//! - [`DropletStager`]: fetches `<sha1>.tgz` once per content hash, unpacks
//!   it into the instance directory and binds the runtime executable
//! - [`BitsSource`]: where tarballs come from; [`HttpBitsSource`] downloads
//!   them with reqwest
//! - [`MockStager`]: records requests, for tests

mod source;
mod stager;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

pub use source::{BitsSource, HttpBitsSource};
pub use stager::{DropletStager, RUNTIME_PLACEHOLDER};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download of {uri} failed with status {status}")]
    Download { uri: String, status: u16 },

    #[error("SHA-1 mismatch: expected {expected}, got {actual}")]
    ShaMismatch { expected: String, actual: String },

    #[error("staging task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("mock stager configured to fail")]
    Mock,
}

/// What to stage and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRequest {
    pub bits_uri: String,
    /// Location of the bits on a shared filesystem, if mounted.
    pub bits_file: String,
    pub sha1: String,
    pub target_dir: PathBuf,
    /// Substituted into the startup script.
    pub runtime_executable: Option<String>,
}

/// Staging collaborator.
#[async_trait]
pub trait Stager: Send + Sync {
    /// Leaves an unpacked, runnable droplet in `request.target_dir`.
    async fn stage_app_bits(&self, request: &StageRequest) -> Result<(), StagingError>;
}

/// Stager that creates the target directory and nothing else.
pub struct MockStager {
    requests: Mutex<Vec<StageRequest>>,
    calls: AtomicUsize,
    fail: bool,
}

impl MockStager {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    /// A stager whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<StageRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl Default for MockStager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stager for MockStager {
    async fn stage_app_bits(&self, request: &StageRequest) -> Result<(), StagingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.fail {
            return Err(StagingError::Mock);
        }

        info!(
            sha1 = %request.sha1,
            target_dir = %request.target_dir.display(),
            "[MOCK] Staging droplet"
        );
        tokio::fs::create_dir_all(&request.target_dir).await?;
        Ok(())
    }
}
