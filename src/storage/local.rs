//! Directory-backed stage storage.
//!
//! One JSON file per record, named `<digest>-<unique_id>.json`. Saves write
//! to a temporary file in the same directory and rename it into place, so
//! concurrent saves for the same digest are both visible and neither is
//! lost. The directory may live on shared storage; records are the only
//! mutable state.

use crate::digest::Digest;
use crate::error::{Result, StagecraftError};
use crate::storage::{StageRecord, StageStorage};
use async_trait::async_trait;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug)]
pub struct LocalStageStorage {
    dir: PathBuf,
}

impl LocalStageStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|source| StagecraftError::Io { path: dir.clone(), source })?;
        Ok(Self { dir })
    }

    fn record_path(&self, digest: &Digest, unique_id: i64) -> PathBuf {
        self.dir.join(format!("{digest}-{unique_id}.json"))
    }
}

#[async_trait]
impl StageStorage for LocalStageStorage {
    async fn find_by_digest(&self, digest: &Digest) -> Result<Vec<StageRecord>> {
        let prefix = format!("{digest}-");
        let mut records = Vec::new();

        let entries = fs::read_dir(&self.dir)
            .map_err(|source| StagecraftError::Io { path: self.dir.clone(), source })?;
        for entry in entries {
            let entry =
                entry.map_err(|source| StagecraftError::Io { path: self.dir.clone(), source })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let content = fs::read_to_string(entry.path())
                .map_err(|source| StagecraftError::Io { path: entry.path(), source })?;
            let record: StageRecord =
                serde_json::from_str(&content).map_err(|e| StagecraftError::Storage {
                    reason: format!("corrupt stage record {name}: {e}"),
                })?;
            records.push(record);
        }

        records.sort_by_key(|r| (r.created_at, r.unique_id));
        Ok(records)
    }

    async fn save(&self, record: StageRecord) -> Result<()> {
        let path = self.record_path(&record.digest, record.unique_id);
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| StagecraftError::Storage { reason: e.to_string() })?;

        // Write-then-rename keeps partially written records invisible.
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|source| StagecraftError::Io { path: self.dir.clone(), source })?;
        temp.write_all(json.as_bytes())
            .map_err(|source| StagecraftError::Io { path: path.clone(), source })?;
        temp.persist(&path).map_err(|e| StagecraftError::Io { path: path.clone(), source: e.error })?;

        debug!(digest = %record.digest.short(), unique_id = record.unique_id, "saved stage record");
        Ok(())
    }

    fn address(&self) -> String {
        self.dir.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(digest: &Digest, unique_id: i64) -> StageRecord {
        StageRecord {
            digest: digest.clone(),
            unique_id,
            created_at: Utc::now(),
            image_ref: format!("proj:{digest}-{unique_id}"),
            parent_digest: Some(Digest::compute(&["parent"])),
        }
    }

    #[tokio::test]
    async fn save_then_find_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStageStorage::new(dir.path()).unwrap();
        let digest = Digest::compute(&["stage"]);

        let saved = record(&digest, 7);
        storage.save(saved.clone()).await.unwrap();

        let found = storage.find_by_digest(&digest).await.unwrap();
        assert_eq!(found, vec![saved]);
    }

    #[tokio::test]
    async fn concurrent_saves_for_one_digest_are_both_visible() {
        let dir = TempDir::new().unwrap();
        let storage = std::sync::Arc::new(LocalStageStorage::new(dir.path()).unwrap());
        let digest = Digest::compute(&["stage"]);

        let mut handles = Vec::new();
        for unique_id in [1, 2] {
            let storage = storage.clone();
            let rec = record(&digest, unique_id);
            handles.push(tokio::spawn(async move { storage.save(rec).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let found = storage.find_by_digest(&digest).await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn other_digests_are_not_returned() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStageStorage::new(dir.path()).unwrap();
        let a = Digest::compute(&["a"]);
        let b = Digest::compute(&["b"]);

        storage.save(record(&a, 1)).await.unwrap();
        assert!(storage.find_by_digest(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_are_sorted_oldest_first() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStageStorage::new(dir.path()).unwrap();
        let digest = Digest::compute(&["stage"]);

        let mut older = record(&digest, 2);
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        let newer = record(&digest, 1);

        storage.save(newer).await.unwrap();
        storage.save(older.clone()).await.unwrap();

        let found = storage.find_by_digest(&digest).await.unwrap();
        assert_eq!(found[0], older);
    }
}
