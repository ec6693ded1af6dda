//! Named mutual-exclusion locks for builders racing on the same stage.
//!
//! A lock key is `(project, stage-name, digest)` flattened into a string.
//! Acquisition is scoped: the guard releases on every exit path, including
//! panics, via Drop. A lock that cannot be acquired within the timeout, or
//! that appears held past its staleness bound, surfaces as an error. A held
//! lock is never silently broken.

use crate::digest::Digest;
use crate::error::{Result, StagecraftError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// An acquired lock. Dropping the guard releases the lock.
pub struct LockGuard {
    _held: Box<dyn Send>,
}

impl LockGuard {
    pub fn new(held: impl Send + 'static) -> Self {
        Self { _held: Box::new(held) }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

/// Mutual-exclusion provider. Locks on distinct keys never block each other.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, key: &str) -> Result<LockGuard>;
}

/// Runs `critical` while holding the named lock. The lock is released on
/// every exit path: success, error, or panic inside the critical section.
pub async fn with_lock<M, F, Fut, T>(locks: &M, key: &str, critical: F) -> Result<T>
where
    M: LockManager + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let guard = locks.acquire(key).await?;
    let outcome = critical().await;
    drop(guard);
    outcome
}

/// In-process lock manager: one tokio mutex per key.
pub struct ProcessLockManager {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    acquire_timeout: Duration,
}

impl ProcessLockManager {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self { locks: Mutex::new(HashMap::new()), acquire_timeout }
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks.entry(key.to_string()).or_default().clone()
    }
}

impl Default for ProcessLockManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(60 * 10))
    }
}

#[async_trait]
impl LockManager for ProcessLockManager {
    async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let slot = self.slot(key);
        let guard = timeout(self.acquire_timeout, slot.lock_owned()).await.map_err(|_| {
            StagecraftError::LockTimeout { key: key.to_string(), timeout: self.acquire_timeout }
        })?;
        debug!(key, "acquired process lock");
        Ok(LockGuard::new(guard))
    }
}

/// Owner metadata written into a lock file for debuggability.
#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    owner_id: String,
    acquired_at: chrono::DateTime<chrono::Utc>,
}

/// File-based lock manager over a (possibly shared) directory.
///
/// A lock is a file created with `create_new`; existence means held. A lock
/// file older than `stale_after` is reported as an error for the operator to
/// resolve rather than being stolen.
pub struct FileLockManager {
    dir: PathBuf,
    acquire_timeout: Duration,
    poll_interval: Duration,
    stale_after: Duration,
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>, acquire_timeout: Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|source| StagecraftError::Io { path: dir.clone(), source })?;
        Ok(Self {
            dir,
            acquire_timeout,
            poll_interval: Duration::from_millis(100),
            stale_after: Duration::from_secs(60 * 60),
        })
    }

    pub fn with_staleness(mut self, stale_after: Duration, poll_interval: Duration) -> Self {
        self.stale_after = stale_after;
        self.poll_interval = poll_interval;
        self
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        // Keys contain separators and digests; hash them into a fixed name.
        let token = Digest::compute(&[key]);
        self.dir.join(format!("{}.lock", &token.as_str()[..32]))
    }

    fn try_create(&self, path: &Path, key: &str) -> Result<Option<FileLockHeld>> {
        match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let owner = LockOwner {
                    pid: std::process::id(),
                    owner_id: uuid::Uuid::new_v4().to_string(),
                    acquired_at: chrono::Utc::now(),
                };
                let payload = serde_json::to_string(&owner)
                    .map_err(|e| StagecraftError::Storage { reason: e.to_string() })?;
                file.write_all(payload.as_bytes())
                    .map_err(|source| StagecraftError::Io { path: path.to_path_buf(), source })?;
                Ok(Some(FileLockHeld { path: path.to_path_buf() }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                self.check_staleness(path, key)?;
                Ok(None)
            }
            Err(source) => Err(StagecraftError::Io { path: path.to_path_buf(), source }),
        }
    }

    fn check_staleness(&self, path: &Path, key: &str) -> Result<()> {
        let Ok(meta) = std::fs::metadata(path) else {
            // Holder released between our create attempt and this check.
            return Ok(());
        };
        let age = meta.modified().ok().and_then(|m| m.elapsed().ok()).unwrap_or_default();
        if age > self.stale_after {
            return Err(StagecraftError::LockFailed {
                key: key.to_string(),
                reason: format!(
                    "lock file {} held for {age:?}, longer than the staleness bound {:?}; \
                     refusing to break it",
                    path.display(),
                    self.stale_after
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LockManager for FileLockManager {
    async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let path = self.lock_path(key);
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            if let Some(held) = self.try_create(&path, key)? {
                debug!(key, path = %path.display(), "acquired file lock");
                return Ok(LockGuard::new(held));
            }
            if Instant::now() >= deadline {
                return Err(StagecraftError::LockTimeout {
                    key: key.to_string(),
                    timeout: self.acquire_timeout,
                });
            }
            sleep(self.poll_interval).await;
        }
    }
}

struct FileLockHeld {
    path: PathBuf,
}

impl Drop for FileLockHeld {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn assert_mutual_exclusion(locks: Arc<dyn LockManager>) {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            handles.push(tokio::spawn(async move {
                with_lock(locks.as_ref(), "stage/proj/RUN1@abc", || async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn process_lock_mutual_exclusion() {
        assert_mutual_exclusion(Arc::new(ProcessLockManager::default())).await;
    }

    #[tokio::test]
    async fn file_lock_mutual_exclusion() {
        let dir = TempDir::new().unwrap();
        let locks = FileLockManager::new(dir.path(), Duration::from_secs(10))
            .unwrap()
            .with_staleness(Duration::from_secs(60), Duration::from_millis(5));
        assert_mutual_exclusion(Arc::new(locks)).await;
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let locks = ProcessLockManager::new(Duration::from_millis(200));
        let _a = locks.acquire("digest-a").await.unwrap();
        // Holding a must not delay b beyond its timeout.
        let _b = locks.acquire("digest-b").await.unwrap();
    }

    #[tokio::test]
    async fn held_process_lock_times_out() {
        let locks = ProcessLockManager::new(Duration::from_millis(50));
        let _held = locks.acquire("contended").await.unwrap();
        let err = locks.acquire("contended").await.unwrap_err();
        assert!(matches!(err, StagecraftError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn held_file_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let locks = FileLockManager::new(dir.path(), Duration::from_millis(50))
            .unwrap()
            .with_staleness(Duration::from_secs(60), Duration::from_millis(10));
        let _held = locks.acquire("contended").await.unwrap();
        let err = locks.acquire("contended").await.unwrap_err();
        assert!(matches!(err, StagecraftError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn file_lock_released_on_error_path() {
        let dir = TempDir::new().unwrap();
        let locks = FileLockManager::new(dir.path(), Duration::from_millis(100)).unwrap();

        let outcome: Result<()> = with_lock(&locks, "k", || async {
            Err(StagecraftError::Internal("critical section failed".into()))
        })
        .await;
        assert!(outcome.is_err());

        // Lock must be free again.
        let _reacquired = locks.acquire("k").await.unwrap();
    }

    #[tokio::test]
    async fn stale_file_lock_is_an_error_not_broken() {
        let dir = TempDir::new().unwrap();
        let locks = FileLockManager::new(dir.path(), Duration::from_secs(5))
            .unwrap()
            .with_staleness(Duration::from_millis(20), Duration::from_millis(5));

        let held = locks.acquire("stuck").await.unwrap();
        sleep(Duration::from_millis(60)).await;

        let err = locks.acquire("stuck").await.unwrap_err();
        assert!(matches!(err, StagecraftError::LockFailed { .. }));
        drop(held);
    }

    #[tokio::test]
    async fn guard_formats_for_assertions() {
        let locks = ProcessLockManager::new(Duration::from_secs(1));
        let guard = locks.acquire("k").await.unwrap();
        assert!(format!("{guard:?}").contains("LockGuard"));
    }
}
