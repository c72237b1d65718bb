//! # File Locking Service
//!
//! Advisory, cross-process mutual exclusion keyed by resource name (an
//! identifier or the shared config resource).
//!
//! Each resource has a lock file under `<root>/locks/`. A holder takes an
//! exclusive `flock` on it and keeps the file open for as long as the
//! [`LockGuard`] lives; the kernel drops the lock when the descriptor is
//! closed, including when the holding process dies. A live holder can
//! therefore never lose its lock, however long its operation runs, and
//! there is no staleness threshold to tune.
//!
//! While held, the file records who holds it:
//!
//! ```text
//! <root>/locks/<urlEncode(resource)>.lock
//! { "token": "...", "pid": 4242, "resource": "did:example:abc", "acquiredAt": "..." }
//! ```
//!
//! Lock files are never deleted. Unlinking a locked file would let the
//! next contender lock a fresh inode while the old holder still runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use shared::{
    config::{LockConfig, StoreConfig},
    constants::LOCK_EXTENSION,
    error::{StoreError, StoreResult},
};

use crate::collection::{encode_key, ensure_dir, io_error};

#[cfg(unix)]
use shared::constants::FILE_MODE;

/// Holder record written into a held lock file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct Lease {
    token: Uuid,
    pid: u32,
    resource: String,
    acquired_at: DateTime<Utc>,
}

// =============================================================================
// LOCK SERVICE
// =============================================================================

/// Hands out exclusive locks on named resources
#[derive(Debug, Clone)]
pub struct LockService {
    /// Directory holding lock files
    dir: PathBuf,

    /// Retry policy
    policy: LockConfig,
}

impl LockService {
    /// Create a lock service over `dir`
    pub fn new(dir: impl Into<PathBuf>, policy: LockConfig) -> Self {
        Self {
            dir: dir.into(),
            policy,
        }
    }

    /// Lock service for a store configuration
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.locks_dir(), config.lock.clone())
    }

    /// Lock file of `resource`
    pub fn lease_path(&self, resource: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", encode_key(resource), LOCK_EXTENSION))
    }

    /// Acquire exclusive ownership of `resource`
    ///
    /// Retries up to the configured budget. Fails with `LockTimeout` when
    /// the budget is exhausted.
    pub async fn acquire(&self, resource: &str) -> StoreResult<LockGuard> {
        ensure_dir(&self.dir).await?;

        let path = self.lease_path(resource);
        let mut file = open_lock_file(&path).await?;
        let retries = self.policy.retries.max(1);

        for attempt in 1..=retries {
            let locked = try_lock_exclusive(&file).map_err(|e| io_error("lock", &path, e))?;

            if locked {
                let lease = Lease {
                    token: Uuid::new_v4(),
                    pid: std::process::id(),
                    resource: resource.to_string(),
                    acquired_at: Utc::now(),
                };
                if let Err(e) = write_lease(&mut file, &lease).await {
                    unlock(&file);
                    return Err(io_error("write lease", &path, e));
                }

                debug!(resource = %resource, attempt, "Lock acquired");
                return Ok(LockGuard {
                    resource: resource.to_string(),
                    path,
                    token: lease.token,
                    file: Some(file),
                });
            }

            if attempt < retries {
                tokio::time::sleep(self.policy.retry_delay()).await;
            }
        }

        let holder = read_lease(&path).await;
        warn!(
            resource = %resource,
            attempts = retries,
            holder_pid = ?holder.as_ref().map(|l| l.pid),
            held_since = ?holder.as_ref().map(|l| l.acquired_at),
            "Lock acquisition timed out"
        );
        Err(StoreError::LockTimeout {
            resource: resource.to_string(),
            attempts: retries,
        })
    }
}

async fn open_lock_file(path: &Path) -> StoreResult<File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    options.mode(FILE_MODE);

    options
        .open(path)
        .await
        .map_err(|e| io_error("open lock file", path, e))
}

async fn write_lease(file: &mut File, lease: &Lease) -> std::io::Result<()> {
    let content = serde_json::to_vec(lease)?;
    file.set_len(0).await?;
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&content).await?;
    file.flush().await?;
    file.sync_data().await
}

async fn read_lease(path: &Path) -> Option<Lease> {
    let content = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&content).ok()
}

/// Take an exclusive `flock` without blocking; `false` when it is held
#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        "resource locking requires flock",
    ))
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

// =============================================================================
// LOCK GUARD
// =============================================================================

/// Single-use releaser for an acquired lock
///
/// [`LockGuard::release`] consumes the guard, so a lock cannot be released
/// twice. A guard dropped without being released (early return, `?`,
/// panic) unlocks synchronously.
#[derive(Debug)]
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard {
    resource: String,
    path: PathBuf,
    token: Uuid,
    file: Option<File>,
}

impl LockGuard {
    /// Resource this guard holds
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Release the lock
    ///
    /// Fails with `LockLost` when the lock file no longer names this
    /// holder, which means something wrote to it without holding the lock.
    pub async fn release(mut self) -> StoreResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        let owned = read_lease(&self.path)
            .await
            .is_some_and(|lease| lease.token == self.token);

        if owned {
            if let Err(e) = file.set_len(0).await {
                warn!(resource = %self.resource, error = %e, "Failed to clear lock file");
            }
        }
        unlock(&file);

        if !owned {
            warn!(resource = %self.resource, path = ?self.path, "Lock file was overwritten while held");
            return Err(StoreError::LockLost {
                resource: self.resource.clone(),
            });
        }

        debug!(resource = %self.resource, "Lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            unlock(&file);
            debug!(resource = %self.resource, "Lock released on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_policy(retries: u32) -> LockConfig {
        LockConfig {
            retries,
            retry_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let locks = LockService::new(dir.path().join("locks"), fast_policy(3));
        let path = locks.lease_path("did:example:abc");

        let guard = locks.acquire("did:example:abc").await.unwrap();
        assert_eq!(guard.resource(), "did:example:abc");

        let lease = read_lease(&path).await.unwrap();
        assert_eq!(lease.resource, "did:example:abc");
        assert_eq!(lease.pid, std::process::id());

        guard.release().await.unwrap();

        // The file stays behind, empty
        assert!(path.exists());
        assert!(read_lease(&path).await.is_none());
    }

    #[tokio::test]
    async fn test_contention_times_out() {
        let dir = tempdir().unwrap();
        let locks = LockService::new(dir.path().join("locks"), fast_policy(3));

        let _held = locks.acquire("config").await.unwrap();
        let result = locks.acquire("config").await;

        match result {
            Err(StoreError::LockTimeout { resource, attempts }) => {
                assert_eq!(resource, "config");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_independent_resources_do_not_contend() {
        let dir = tempdir().unwrap();
        let locks = LockService::new(dir.path().join("locks"), fast_policy(1));

        let a = locks.acquire("did:example:a").await.unwrap();
        let b = locks.acquire("did:example:b").await.unwrap();

        a.release().await.unwrap();
        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let dir = tempdir().unwrap();
        let locks = LockService::new(dir.path().join("locks"), fast_policy(1));

        {
            let _guard = locks.acquire("did:example:abc").await.unwrap();
        }

        let guard = locks.acquire("did:example:abc").await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let dir = tempdir().unwrap();
        let locks = Arc::new(LockService::new(dir.path().join("locks"), fast_policy(200)));

        let guard = locks.acquire("did:example:abc").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("did:example:abc").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_old_lock_is_never_taken_from_live_holder() {
        let dir = tempdir().unwrap();
        let locks = LockService::new(dir.path().join("locks"), fast_policy(3));
        let path = locks.lease_path("did:example:abc");

        let guard = locks.acquire("did:example:abc").await.unwrap();

        // Backdate the holder record far into the past
        let mut lease = read_lease(&path).await.unwrap();
        lease.acquired_at = Utc::now() - chrono::Duration::hours(1);
        std::fs::write(&path, serde_json::to_vec(&lease).unwrap()).unwrap();

        assert!(matches!(
            locks.acquire("did:example:abc").await,
            Err(StoreError::LockTimeout { .. })
        ));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_leftover_holder_record_does_not_block() {
        let dir = tempdir().unwrap();
        let locks = LockService::new(dir.path().join("locks"), fast_policy(1));
        let path = locks.lease_path("did:example:abc");

        // Written by a holder that died without unlocking
        let abandoned = Lease {
            token: Uuid::new_v4(),
            pid: 1,
            resource: "did:example:abc".into(),
            acquired_at: Utc::now(),
        };
        ensure_dir(path.parent().unwrap()).await.unwrap();
        std::fs::write(&path, serde_json::to_vec(&abandoned).unwrap()).unwrap();

        let guard = locks.acquire("did:example:abc").await.unwrap();
        assert_ne!(read_lease(&path).await.unwrap().token, abandoned.token);
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_reports_overwritten_lock_file() {
        let dir = tempdir().unwrap();
        let locks = LockService::new(dir.path().join("locks"), fast_policy(1));
        let path = locks.lease_path("did:example:abc");

        let guard = locks.acquire("did:example:abc").await.unwrap();

        let foreign = Lease {
            token: Uuid::new_v4(),
            pid: 7,
            resource: "did:example:abc".into(),
            acquired_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_vec(&foreign).unwrap()).unwrap();

        match guard.release().await {
            Err(StoreError::LockLost { resource }) => assert_eq!(resource, "did:example:abc"),
            other => panic!("expected LockLost, got {other:?}"),
        }
        assert_eq!(read_lease(&path).await.unwrap().token, foreign.token);

        // The lock itself was released
        let guard = locks.acquire("did:example:abc").await.unwrap();
        guard.release().await.unwrap();
    }
}
