//! Content-addressed droplet cache and unpacker.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use sha1::{Digest, Sha1};
use tar::Archive;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BitsSource, StageRequest, Stager, StagingError};

/// Placeholder in startup scripts replaced by the runtime executable.
pub const RUNTIME_PLACEHOLDER: &str = "%VCAP_LOCAL_RUNTIME%";

/// Stages droplets from `<staged_dir>/<sha1>.tgz`.
///
/// The tarball is fetched at most once at a time per sha1: the first
/// requester fetches under a per-sha1 lock, later requesters wait on the same
/// lock and find the tarball in place. A reference count of in-flight unpacks
/// decides when the cached tarball can be removed.
pub struct DropletStager {
    staged_dir: PathBuf,
    shared_dir: Option<PathBuf>,
    keep_tarballs: bool,
    source: Arc<dyn BitsSource>,
    fetch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    unpacks: StdMutex<HashMap<String, usize>>,
}

impl DropletStager {
    pub fn new(
        staged_dir: PathBuf,
        shared_dir: Option<PathBuf>,
        keep_tarballs: bool,
        source: Arc<dyn BitsSource>,
    ) -> Self {
        Self {
            staged_dir,
            shared_dir,
            keep_tarballs,
            source,
            fetch_locks: Mutex::new(HashMap::new()),
            unpacks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn tarball_path(&self, sha1: &str) -> PathBuf {
        self.staged_dir.join(format!("{sha1}.tgz"))
    }

    /// Number of unpacks in flight for `sha1`.
    pub fn pending_unpacks(&self, sha1: &str) -> usize {
        self.unpacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sha1)
            .copied()
            .unwrap_or(0)
    }

    async fn fetch_lock(&self, sha1: &str) -> Arc<Mutex<()>> {
        let mut locks = self.fetch_locks.lock().await;
        Arc::clone(locks.entry(sha1.to_string()).or_default())
    }

    /// Returns a lock taken with [`Self::fetch_lock`], forgetting it once
    /// no other requester holds it.
    async fn release_fetch_lock(&self, sha1: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.fetch_locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(sha1);
        }
    }

    /// Number of digests with a fetch lock outstanding.
    pub async fn pending_fetches(&self) -> usize {
        self.fetch_locks.lock().await.len()
    }

    fn begin_unpack(&self, sha1: &str) {
        *self
            .unpacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sha1.to_string())
            .or_insert(0) += 1;
    }

    /// Drops one unpack reference, removing the tarball after the last one.
    fn end_unpack(&self, sha1: &str) {
        let mut unpacks = self.unpacks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = unpacks.get_mut(sha1) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        unpacks.remove(sha1);

        if !self.keep_tarballs {
            let path = self.tarball_path(sha1);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove droplet tarball");
                }
            }
        }
    }

    /// Makes sure `<sha1>.tgz` is present, fetching it if needed.
    async fn ensure_tarball(&self, request: &StageRequest) -> Result<PathBuf, StagingError> {
        let tarball = self.tarball_path(&request.sha1);
        if tarball.exists() {
            debug!(sha1 = %request.sha1, "Droplet tarball cached");
            return Ok(tarball);
        }

        let lock = self.fetch_lock(&request.sha1).await;
        let fetched = {
            let _guard = lock.lock().await;
            // Another requester may have fetched it while we waited.
            if tarball.exists() {
                Ok(())
            } else {
                self.fetch_tarball(request, &tarball).await
            }
        };
        self.release_fetch_lock(&request.sha1, lock).await;
        fetched.map(|()| tarball)
    }

    /// Fetches or copies the tarball into place, verifying its digest.
    async fn fetch_tarball(&self, request: &StageRequest, tarball: &Path) -> Result<(), StagingError> {
        let start = Instant::now();
        tokio::fs::create_dir_all(&self.staged_dir).await?;
        let pending = self.staged_dir.join(format!("{}.pending", request.sha1));

        match self.shared_bits(&request.bits_file) {
            Some(shared) => {
                debug!(sha1 = %request.sha1, from = %shared.display(), "Copying droplet from shared dir");
                tokio::fs::copy(&shared, &pending).await?;
            }
            None => {
                self.source.fetch(&request.bits_uri, &pending).await?;
            }
        }

        let path = pending.clone();
        let actual = tokio::task::spawn_blocking(move || file_sha1(&path)).await??;
        if actual != request.sha1 {
            let _ = tokio::fs::remove_file(&pending).await;
            return Err(StagingError::ShaMismatch {
                expected: request.sha1.clone(),
                actual,
            });
        }
        tokio::fs::rename(&pending, tarball).await?;

        info!(
            sha1 = %request.sha1,
            duration_ms = start.elapsed().as_millis() as u64,
            "Droplet fetched"
        );
        Ok(())
    }

    /// The bits file on the shared filesystem, if it is there.
    fn shared_bits(&self, bits_file: &str) -> Option<PathBuf> {
        let shared_dir = self.shared_dir.as_ref()?;
        if bits_file.is_empty() {
            return None;
        }
        let candidate = shared_dir.join(bits_file);
        let inside = candidate.starts_with(shared_dir)
            && !candidate.components().any(|c| c == Component::ParentDir);
        (inside && candidate.is_file()).then_some(candidate)
    }

    async fn stage(&self, request: &StageRequest) -> Result<(), StagingError> {
        let tarball = self.ensure_tarball(request).await?;

        let target = request.target_dir.clone();
        tokio::task::spawn_blocking(move || unpack(&tarball, &target)).await??;

        let startup = request.target_dir.join("startup");
        let executable = request.runtime_executable.clone();
        tokio::task::spawn_blocking(move || bind_runtime(&startup, executable.as_deref()))
            .await??;
        Ok(())
    }
}

#[async_trait]
impl Stager for DropletStager {
    async fn stage_app_bits(&self, request: &StageRequest) -> Result<(), StagingError> {
        // Counted before the fetch so the tarball outlives every waiter.
        self.begin_unpack(&request.sha1);
        let result = self.stage(request).await;
        self.end_unpack(&request.sha1);

        match &result {
            Ok(()) => info!(
                sha1 = %request.sha1,
                target_dir = %request.target_dir.display(),
                "Droplet staged"
            ),
            Err(e) => warn!(sha1 = %request.sha1, error = %e, "Staging failed"),
        }
        result
    }
}

/// Hex SHA-1 of a file.
pub(crate) fn file_sha1(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn unpack(tarball: &Path, target: &Path) -> Result<(), StagingError> {
    fs::create_dir_all(target)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(File::open(tarball)?)));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping droplet entry outside the target");
            continue;
        }
        entry.unpack_in(target)?;
    }
    Ok(())
}

/// Points the startup script at the local runtime and makes it executable.
fn bind_runtime(startup: &Path, executable: Option<&str>) -> io::Result<()> {
    if !startup.exists() {
        return Ok(());
    }
    if let Some(executable) = executable {
        let script = fs::read_to_string(startup)?;
        if script.contains(RUNTIME_PLACEHOLDER) {
            fs::write(startup, script.replace(RUNTIME_PLACEHOLDER, executable))?;
        }
    }
    fs::set_permissions(startup, fs::Permissions::from_mode(0o755))
}
