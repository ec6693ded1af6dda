//! Shared stage storage.
//!
//! Built stages are persisted as records keyed by content digest. Several
//! records may share a digest when hosts race; the selection rule in
//! [`select_suitable`] decides which one a build reuses.

pub mod local;
pub mod lock;
pub mod memory;

pub use local::LocalStageStorage;
pub use lock::{with_lock, FileLockManager, LockGuard, LockManager, ProcessLockManager};
pub use memory::MemoryStageStorage;

use crate::digest::Digest;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// A persisted record of one successfully built and committed stage image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Content digest of the stage; the cache key.
    pub digest: Digest,
    /// Monotonic, time-ordered tiebreaker assigned at creation.
    pub unique_id: i64,
    /// When the record was persisted. The earliest record for a digest is
    /// the long-term cache winner.
    pub created_at: DateTime<Utc>,
    /// Fully qualified image reference of the committed stage.
    pub image_ref: String,
    /// Digest of the stage this one was built on, if any. Used for the
    /// ancestry compatibility check during candidate selection.
    pub parent_digest: Option<Digest>,
}

/// Abstract repository of built stage images.
///
/// May be realized over a registry tag namespace, a database or a local
/// directory; callers rely only on these semantics.
#[async_trait]
pub trait StageStorage: Send + Sync {
    /// Returns every record persisted under the digest. Never blocks on
    /// other builders.
    async fn find_by_digest(&self, digest: &Digest) -> Result<Vec<StageRecord>>;

    /// Persists a record. Atomic with respect to concurrent saves of the
    /// same digest: both records become visible, neither is lost.
    async fn save(&self, record: StageRecord) -> Result<()>;

    /// The canonical image reference for a stage in this storage.
    fn construct_stage_ref(&self, project: &str, digest: &Digest, unique_id: i64) -> String {
        format!("{project}:{digest}-{unique_id}")
    }

    /// Human-readable storage address for log lines.
    fn address(&self) -> String;
}

static LAST_UNIQUE_ID: AtomicI64 = AtomicI64::new(0);

/// Generates a fresh unique id: Unix time in milliseconds, bumped past any
/// id already used in this process or present in `existing` so ids stay
/// monotonic within a process and unique per digest.
pub fn generate_unique_id(existing: &[StageRecord]) -> i64 {
    let now = Utc::now().timestamp_millis();
    let previous = LAST_UNIQUE_ID
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(last.max(now - 1) + 1))
        .unwrap_or(now - 1);
    let mut candidate = previous.max(now - 1) + 1;
    while existing.iter().any(|r| r.unique_id == candidate) {
        candidate += 1;
    }
    LAST_UNIQUE_ID.fetch_max(candidate, Ordering::SeqCst);
    candidate
}

/// Candidate-selection rule: among records whose parent digest matches the
/// ancestor chosen for this run, pick the earliest persisted record (oldest
/// surviving winner; `unique_id` breaks `created_at` ties). Records with an
/// incompatible ancestry are never accepted as cache hits.
pub fn select_suitable<'a>(
    records: &'a [StageRecord],
    parent: Option<&Digest>,
) -> Option<&'a StageRecord> {
    records
        .iter()
        .filter(|r| r.parent_digest.as_ref() == parent)
        .min_by_key(|r| (r.created_at, r.unique_id))
}
