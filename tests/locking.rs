//! Integration tests for cross-process file locking.
//!
//! Two lock managers pointed at the same directory stand in for two builder
//! processes. Tests verify mutual exclusion, release on drop, timeout as an
//! error, and stale-lock reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stagecraft::{FileLockManager, LockManager, StagecraftError};

fn manager(dir: &std::path::Path, timeout: Duration) -> FileLockManager {
    FileLockManager::new(dir, timeout).unwrap()
}

/// Two managers over the same directory never hold the same key at once.
#[tokio::test]
async fn test_mutual_exclusion_across_managers() {
    let dir = tempfile::tempdir().unwrap();
    let a = Arc::new(manager(dir.path(), Duration::from_secs(10)));
    let b = Arc::new(manager(dir.path(), Duration::from_secs(10)));

    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let manager: Arc<FileLockManager> = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        tasks.spawn(async move {
            let guard = manager.acquire("stage/web/app@abc").await.unwrap();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            drop(guard);
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

/// Dropping the guard removes the lock file, so a second acquisition
/// succeeds immediately.
#[tokio::test]
async fn test_release_on_drop_frees_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let locks = manager(dir.path(), Duration::from_millis(200));

    let guard = locks.acquire("stage/web/app@abc").await.unwrap();
    drop(guard);

    let reacquired = locks.acquire("stage/web/app@abc").await;
    assert!(reacquired.is_ok());
    drop(reacquired);

    // no lock files left behind
    let leftover = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftover, 0);
}

/// Waiting past the acquire timeout surfaces a timeout error instead of
/// silently taking over the lock.
#[tokio::test]
async fn test_timeout_is_an_error_not_a_takeover() {
    let dir = tempfile::tempdir().unwrap();
    let holder = manager(dir.path(), Duration::from_secs(10));
    let waiter = manager(dir.path(), Duration::from_millis(150));

    let _held = holder.acquire("stage/web/app@abc").await.unwrap();
    let err = waiter.acquire("stage/web/app@abc").await.unwrap_err();
    assert!(matches!(err, StagecraftError::LockTimeout { .. }));

    // the original holder still owns the key
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

/// A lock file older than the staleness threshold is reported as an error;
/// it is never silently broken.
#[tokio::test]
async fn test_stale_lock_is_reported_not_broken() {
    let dir = tempfile::tempdir().unwrap();
    let locks = FileLockManager::new(dir.path(), Duration::from_millis(200))
        .unwrap()
        .with_staleness(Duration::from_millis(50), Duration::from_millis(20));

    let held = locks.acquire("stage/web/app@abc").await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let err = locks.acquire("stage/web/app@abc").await.unwrap_err();
    assert!(matches!(err, StagecraftError::LockFailed { .. }));
    drop(held);
}

/// Distinct keys never contend.
#[tokio::test]
async fn test_distinct_keys_do_not_block() {
    let dir = tempfile::tempdir().unwrap();
    let locks = manager(dir.path(), Duration::from_millis(200));

    let _a = locks.acquire("stage/web/app@abc").await.unwrap();
    let b = locks.acquire("stage/web/app@def").await;
    assert!(b.is_ok());
}
