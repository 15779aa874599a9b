//! Saving and loading sync state between runs.

use crate::error::Result;
use async_trait::async_trait;
use notesync_engine::SyncSnapshot;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// Where sync snapshots are kept.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// The last saved snapshot, `None` on first run.
    async fn load(&self) -> Result<Option<SyncSnapshot>>;

    async fn save(&self, snapshot: &SyncSnapshot) -> Result<()>;
}

/// Snapshot stored as pretty-printed JSON in a single file.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "notesync".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl Persistence for JsonFilePersistence {
    async fn load(&self) -> Result<Option<SyncSnapshot>> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = SyncSnapshot::from_json(&json)?;
        tracing::debug!(path = %self.path.display(), entities = snapshot.entity_count(), "loaded sync state");
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &SyncSnapshot) -> Result<()> {
        let json = snapshot.to_json_pretty()?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), "saved sync state");
        Ok(())
    }
}

/// Keeps the last snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    snapshot: Mutex<Option<SyncSnapshot>>,
    saves: Mutex<usize>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    pub fn with_snapshot(snapshot: SyncSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> Option<SyncSnapshot> {
        self.snapshot.lock().clone()
    }

    /// Number of saves so far.
    pub fn saves(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load(&self) -> Result<Option<SyncSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    async fn save(&self, snapshot: &SyncSnapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use notesync_engine::{BucketName, BucketSnapshot, Entity, Tag};

    fn sample() -> SyncSnapshot {
        let mut bucket = BucketSnapshot::default();
        bucket.cursor = Some("cv7".into());
        bucket
            .entities
            .insert("t1".into(), Entity::Tag(Tag::named("Work")));
        let mut snapshot = SyncSnapshot::new();
        snapshot.insert(BucketName::Tag, bucket);
        snapshot
    }

    #[tokio::test]
    async fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("state.json"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("nested/state.json"));

        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(sample()));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn save_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("state.json"));

        store.save(&SyncSnapshot::new()).await.unwrap();
        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(sample()));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ nope").unwrap();

        let err = JsonFilePersistence::new(path).load().await.unwrap_err();
        assert!(matches!(err, SyncError::Engine(_)));
    }

    #[tokio::test]
    async fn memory_counts_saves() {
        let store = MemoryPersistence::new();
        assert_eq!(store.load().await.unwrap(), None);
        store.save(&sample()).await.unwrap();
        assert_eq!(store.saves(), 1);
        assert_eq!(store.snapshot(), Some(sample()));
    }
}
