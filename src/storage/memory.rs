//! In-process stage storage.
//!
//! Backs single-host builds and the test suite. Concurrency-safe: saves for
//! the same digest append, they never overwrite each other.

use crate::digest::Digest;
use crate::error::{Result, StagecraftError};
use crate::storage::{StageRecord, StageStorage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStageStorage {
    records: RwLock<HashMap<Digest, Vec<StageRecord>>>,
}

impl MemoryStageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all digests.
    pub fn record_count(&self) -> usize {
        self.records.read().expect("storage lock poisoned").values().map(Vec::len).sum()
    }
}

#[async_trait]
impl StageStorage for MemoryStageStorage {
    async fn find_by_digest(&self, digest: &Digest) -> Result<Vec<StageRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| StagecraftError::Storage { reason: "storage lock poisoned".into() })?;
        Ok(records.get(digest).cloned().unwrap_or_default())
    }

    async fn save(&self, record: StageRecord) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StagecraftError::Storage { reason: "storage lock poisoned".into() })?;
        records.entry(record.digest.clone()).or_default().push(record);
        Ok(())
    }

    fn address(&self) -> String {
        ":memory:".to_string()
    }
}
