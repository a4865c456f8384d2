//! Droplet collection persistence.
//!
//! The whole collection is written as one JSON document:
//!
//! ```text
//! { "<droplet_id>": { "<instance_id>": { ...instance record... } } }
//! ```
//!
//! Writes go to a temp file that is then renamed over the canonical path,
//! so a crash mid-write leaves the previous snapshot intact. Writes requested
//! while one is already scheduled collapse into that one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{DropletCollection, SnapshotDocument};

/// Window in which snapshot requests collapse into one write.
const DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot {path} is not a valid document: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("snapshot writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Debounced writer of the droplet collection.
pub struct SnapshotStore {
    path: PathBuf,
    droplets: Arc<DropletCollection>,
    scheduled: AtomicBool,
    /// Serializes writers so renames never interleave.
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(path: PathBuf, droplets: Arc<DropletCollection>) -> Self {
        Self {
            path,
            droplets,
            scheduled: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot, if there is one.
    pub fn load(&self) -> Result<Option<SnapshotDocument>, SnapshotError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot, starting fresh");
                return Ok(None);
            }
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let document: SnapshotDocument =
            serde_json::from_slice(&content).map_err(|source| SnapshotError::Parse {
                path: self.path.clone(),
                source,
            })?;

        info!(
            path = %self.path.display(),
            droplets = document.len(),
            "Loaded snapshot"
        );
        Ok(Some(document))
    }

    /// Writes `document` atomically.
    pub fn save(&self, document: &SnapshotDocument) -> Result<(), SnapshotError> {
        let content = serde_json::to_vec(document)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &content).map_err(io_err(&tmp_path))?;
        fs::rename(&tmp_path, &self.path).map_err(io_err(&self.path))?;

        debug!(
            path = %self.path.display(),
            droplets = document.len(),
            "Saved snapshot"
        );
        Ok(())
    }

    /// Writes the current collection now, off the async runtime.
    pub async fn snapshot_now(self: &Arc<Self>) -> Result<(), SnapshotError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.save(&store.droplets.to_document())).await?
    }

    /// Schedules a write unless one is already pending.
    pub fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            // Mutations after this point schedule another write.
            store.scheduled.store(false, Ordering::Release);
            if let Err(e) = store.snapshot_now().await {
                warn!(error = %e, "Failed to write snapshot");
            }
        });
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError {
    let path = path.to_path_buf();
    move |source| SnapshotError::Io { path, source }
}
