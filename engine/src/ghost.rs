//! Ghosts: the last entity state acknowledged by the remote.
//!
//! A bucket's ghost store also holds the bucket's change-version cursor, the
//! position in the remote change stream this client last observed.

use crate::{error::Result, ChangeVersion, Entity, EntityId, Version};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Last acknowledged version and snapshot of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ghost {
    pub entity_id: EntityId,
    /// Remote version; 0 means never acknowledged
    pub version: Version,
    /// Acknowledged payload; `None` until the first acknowledgment
    pub snapshot: Option<Entity>,
}

impl Ghost {
    /// The ghost of an entity the remote has never acknowledged.
    pub fn empty(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            version: 0,
            snapshot: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version == 0 && self.snapshot.is_none()
    }

    /// Whether a remote state at `version` is newer than this ghost.
    pub fn accepts(&self, version: Version) -> bool {
        version > self.version
    }
}

/// Storage for a bucket's ghosts and change-version cursor.
///
/// Implementations must be safe to call from several tasks at once. Writes
/// for the same entity resolve last-call-wins; keeping versions monotonic is
/// the caller's job (see [`crate::Reconciler`]).
pub trait GhostStore: Send + Sync {
    /// Version of the ghost, 0 when unknown.
    fn version(&self, id: &str) -> Result<Version>;

    /// Set the version, keeping the existing snapshot.
    fn set_version(&self, id: &str, version: Version) -> Result<()>;

    /// Replace the ghost.
    fn put(&self, id: &str, version: Version, snapshot: Option<Entity>) -> Result<()>;

    /// Fetch the ghost, lazily creating an empty one for unknown ids.
    fn get(&self, id: &str) -> Result<Ghost>;

    fn remove(&self, id: &str) -> Result<()>;

    fn cursor(&self) -> Result<Option<ChangeVersion>>;

    fn set_cursor(&self, cursor: Option<ChangeVersion>) -> Result<()>;

    /// All ghosts, ordered by entity id.
    fn entries(&self) -> Result<Vec<Ghost>>;

    /// Drop every ghost and the cursor.
    fn clear(&self) -> Result<()>;
}

/// In-memory ghost store.
#[derive(Debug, Default)]
pub struct MemoryGhostStore {
    ghosts: DashMap<EntityId, Ghost>,
    cursor: RwLock<Option<ChangeVersion>>,
}

impl MemoryGhostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked ghosts, including lazily created empty ones.
    pub fn len(&self) -> usize {
        self.ghosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ghosts.is_empty()
    }
}

impl GhostStore for MemoryGhostStore {
    fn version(&self, id: &str) -> Result<Version> {
        Ok(self.ghosts.get(id).map(|g| g.version).unwrap_or(0))
    }

    fn set_version(&self, id: &str, version: Version) -> Result<()> {
        self.ghosts
            .entry(id.to_string())
            .or_insert_with(|| Ghost::empty(id))
            .version = version;
        Ok(())
    }

    fn put(&self, id: &str, version: Version, snapshot: Option<Entity>) -> Result<()> {
        self.ghosts.insert(
            id.to_string(),
            Ghost {
                entity_id: id.to_string(),
                version,
                snapshot,
            },
        );
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Ghost> {
        let ghost = self
            .ghosts
            .entry(id.to_string())
            .or_insert_with(|| Ghost::empty(id))
            .value()
            .clone();
        Ok(ghost)
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.ghosts.remove(id);
        Ok(())
    }

    fn cursor(&self) -> Result<Option<ChangeVersion>> {
        Ok(self.cursor.read().clone())
    }

    fn set_cursor(&self, cursor: Option<ChangeVersion>) -> Result<()> {
        *self.cursor.write() = cursor;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<Ghost>> {
        let mut ghosts: Vec<Ghost> = self.ghosts.iter().map(|g| g.value().clone()).collect();
        ghosts.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(ghosts)
    }

    fn clear(&self) -> Result<()> {
        self.ghosts.clear();
        *self.cursor.write() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tag;

    #[test]
    fn unknown_id_yields_empty_ghost() {
        let store = MemoryGhostStore::new();
        let ghost = store.get("t1").unwrap();

        assert!(ghost.is_empty());
        assert_eq!(ghost.entity_id, "t1");
        assert_eq!(store.version("t1").unwrap(), 0);
        // Created lazily on first access
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_then_get() {
        let store = MemoryGhostStore::new();
        let tag = Entity::Tag(Tag::named("Work"));
        store.put("t1", 3, Some(tag.clone())).unwrap();

        let ghost = store.get("t1").unwrap();
        assert_eq!(ghost.version, 3);
        assert_eq!(ghost.snapshot, Some(tag));
    }

    #[test]
    fn last_put_wins() {
        let store = MemoryGhostStore::new();
        store.put("t1", 5, None).unwrap();
        store.put("t1", 2, None).unwrap();
        assert_eq!(store.version("t1").unwrap(), 2);
    }

    #[test]
    fn set_version_keeps_snapshot() {
        let store = MemoryGhostStore::new();
        let tag = Entity::Tag(Tag::named("Work"));
        store.put("t1", 1, Some(tag.clone())).unwrap();
        store.set_version("t1", 4).unwrap();

        let ghost = store.get("t1").unwrap();
        assert_eq!(ghost.version, 4);
        assert_eq!(ghost.snapshot, Some(tag));

        store.set_version("t2", 7).unwrap();
        assert_eq!(store.get("t2").unwrap().snapshot, None);
    }

    #[test]
    fn remove_resets_to_empty() {
        let store = MemoryGhostStore::new();
        store.put("t1", 3, None).unwrap();
        store.remove("t1").unwrap();
        assert!(store.get("t1").unwrap().is_empty());
    }

    #[test]
    fn cursor_roundtrip_and_clear() {
        let store = MemoryGhostStore::new();
        assert_eq!(store.cursor().unwrap(), None);

        store.set_cursor(Some("cv-9".into())).unwrap();
        store.put("t1", 1, None).unwrap();
        assert_eq!(store.cursor().unwrap(), Some("cv-9".to_string()));

        store.clear().unwrap();
        assert_eq!(store.cursor().unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn entries_are_ordered() {
        let store = MemoryGhostStore::new();
        store.put("b", 1, None).unwrap();
        store.put("a", 2, None).unwrap();

        let ids: Vec<_> = store
            .entries()
            .unwrap()
            .into_iter()
            .map(|g| g.entity_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn accepts_only_newer_versions() {
        let mut ghost = Ghost::empty("n1");
        assert!(ghost.accepts(1));
        ghost.version = 3;
        assert!(!ghost.accepts(3));
        assert!(!ghost.accepts(2));
        assert!(ghost.accepts(4));
    }
}
