//! Cross-process run lock on a project or store directory.
//!
//! The lock is a marker file created exclusively. Its mtime is refreshed
//! while the holder runs; a marker older than the stale duration belongs
//! to a dead process and is taken over. Takeover happens under an OS
//! advisory lock on a sidecar file.

use super::options::RetryPolicy;
use crate::pkg::PkgError;
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Marker filename inside the locked directory.
pub const LOCK_FILE: &str = ".linkpm.lock";

/// Sidecar file serializing stale takeovers. Never removed.
pub const RECLAIM_FILE: &str = ".linkpm.lock.reclaim";

/// Shortest interval between mtime refreshes.
const MIN_REFRESH: Duration = Duration::from_millis(10);

/// A held run lock. The marker is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock on `dir`, retrying per `retry`.
    ///
    /// # Errors
    /// Returns `PKG_LOCK_TIMEOUT` when every attempt finds a live marker.
    pub async fn acquire(dir: &Path, stale: Duration, retry: &RetryPolicy) -> Result<Self, PkgError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);

        for attempt in 0..=retry.retries {
            if try_create(&path)? {
                debug!(path = %path.display(), "acquired run lock");
                return Ok(Self { path });
            }
            if reclaim_stale(dir, &path, stale)? && try_create(&path)? {
                return Ok(Self { path });
            }
            if attempt < retry.retries {
                tokio::time::sleep(retry.delay(attempt)).await;
            }
        }

        Err(PkgError::lock_timeout(dir.display()))
    }

    /// Marker path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the lock as still in use.
    ///
    /// # Errors
    /// Returns an error if the marker cannot be updated.
    pub fn refresh(&self) -> io::Result<()> {
        File::options()
            .write(true)
            .open(&self.path)?
            .set_modified(SystemTime::now())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release run lock");
            }
        }
    }
}

fn try_create(path: &Path) -> Result<bool, PkgError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            write!(file, "{}", std::process::id())?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove the marker at `path` if it is stale.
///
/// Staleness is re-checked while holding the reclaim guard, so a marker
/// created by whoever reclaimed first is never removed. Returns `false`
/// when the marker is live or another process is reclaiming.
fn reclaim_stale(dir: &Path, path: &Path, stale: Duration) -> Result<bool, PkgError> {
    if !is_stale(path, stale) {
        return Ok(false);
    }
    let guard = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(dir.join(RECLAIM_FILE))?;
    match guard.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            debug!(path = %path.display(), "stale run lock is being reclaimed elsewhere");
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    if !is_stale(path, stale) {
        return Ok(false);
    }
    warn!(path = %path.display(), "removing stale run lock");
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

fn is_stale(path: &Path, stale: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .is_some_and(|age| age > stale)
}

/// Run `op` while holding the lock on `dir`.
///
/// The lock is released when `op` completes, fails or is dropped.
///
/// # Errors
/// Returns `PKG_LOCK_TIMEOUT` if the lock cannot be taken, otherwise
/// whatever `op` returns.
pub async fn with_lock<T, F, Fut>(
    dir: &Path,
    stale: Duration,
    retry: &RetryPolicy,
    op: F,
) -> Result<T, PkgError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, PkgError>>,
{
    let lock = RunLock::acquire(dir, stale, retry).await?;
    let interval = (stale / 2).max(MIN_REFRESH);

    let op = op();
    tokio::pin!(op);
    loop {
        tokio::select! {
            result = &mut op => return result,
            () = tokio::time::sleep(interval) => {
                if let Err(e) = lock.refresh() {
                    warn!(path = %lock.path().display(), error = %e, "failed to refresh run lock");
                }
            }
        }
    }
}
