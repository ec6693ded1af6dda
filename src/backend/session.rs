//! Working-container registry for interrupted-build cleanup.

use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use async_trait::async_trait;

/// Removes one working container by name. Backends implement this so the
/// session can tear down containers without knowing engine specifics.
#[async_trait]
pub trait ContainerCleaner: Send + Sync {
    async fn remove_container(&self, name: &str) -> Result<()>;
}

/// Tracks working containers created during a build run.
///
/// Every container a backend creates is registered here before anything else
/// runs in it, and deregistered after successful removal. [`teardown`]
/// removes whatever is left, so an interrupted run does not leak containers.
///
/// [`teardown`]: BackendSession::teardown
#[derive(Debug, Default)]
pub struct BackendSession {
    active: Mutex<HashSet<String>>,
}

impl BackendSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) {
        self.active.lock().unwrap().insert(name.to_string());
    }

    pub fn deregister(&self, name: &str) {
        self.active.lock().unwrap().remove(name);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Best-effort removal of every container still registered. Failures are
    /// logged and skipped; the remaining names stay registered so a second
    /// teardown can retry them.
    pub async fn teardown(&self, cleaner: &dyn ContainerCleaner) {
        let names: Vec<String> = self.active.lock().unwrap().iter().cloned().collect();
        for name in names {
            match cleaner.remove_container(&name).await {
                Ok(()) => {
                    debug!(container = %name, "removed leftover working container");
                    self.deregister(&name);
                }
                Err(err) => {
                    warn!(container = %name, %err, "failed to remove leftover working container");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StagecraftError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCleaner {
        removed: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl ContainerCleaner for CountingCleaner {
        async fn remove_container(&self, name: &str) -> Result<()> {
            if self.fail_on == Some(name) {
                return Err(StagecraftError::Backend {
                    backend: "test".into(),
                    reason: "container busy".into(),
                });
            }
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn teardown_removes_registered_containers() {
        let session = BackendSession::new();
        session.register("a");
        session.register("b");
        let cleaner = CountingCleaner { removed: AtomicUsize::new(0), fail_on: None };
        session.teardown(&cleaner).await;
        assert_eq!(cleaner.removed.load(Ordering::SeqCst), 2);
        assert_eq!(session.active_count(), 0);
    }

    #[tokio::test]
    async fn teardown_keeps_failed_removals_registered() {
        let session = BackendSession::new();
        session.register("stuck");
        session.register("fine");
        let cleaner = CountingCleaner { removed: AtomicUsize::new(0), fail_on: Some("stuck") };
        session.teardown(&cleaner).await;
        assert_eq!(session.active_count(), 1);
    }

    #[tokio::test]
    async fn deregister_after_normal_removal() {
        let session = BackendSession::new();
        session.register("ctr");
        session.deregister("ctr");
        assert_eq!(session.active_count(), 0);
    }
}
