//! Local object store - the in-memory cache of current entity data.
//!
//! Holds what the user currently sees for one bucket. Local intents write
//! here first; outbound changes are computed from here against the ghost.

use crate::{error::Result, BucketName, Entity, EntityId, Error};
use dashmap::DashMap;

/// Selects entities for [`ObjectStore::find`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    ids: Option<Vec<EntityId>>,
    include_trashed: bool,
}

impl Query {
    /// Every entity except trashed notes.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the given ids.
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
            include_trashed: false,
        }
    }

    /// Include notes that are in the trash.
    pub fn include_trashed(mut self) -> Self {
        self.include_trashed = true;
        self
    }

    /// Whether an entity is selected by this query.
    pub fn matches(&self, id: &str, entity: &Entity) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|wanted| wanted == id) {
                return false;
            }
        }
        match entity {
            Entity::Note(note) => self.include_trashed || !note.deleted,
            _ => true,
        }
    }
}

/// An owned snapshot of query results, ordered by entity id.
///
/// Not a live view: later store writes are not reflected. `iter` can be
/// called any number of times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Found {
    entries: Vec<(EntityId, Entity)>,
}

impl Found {
    fn new(mut entries: Vec<(EntityId, Entity)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &Entity)> {
        self.entries.iter().map(|(id, entity)| (id, entity))
    }

    pub fn ids(&self) -> Vec<&EntityId> {
        self.entries.iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for Found {
    type Item = (EntityId, Entity);
    type IntoIter = std::vec::IntoIter<(EntityId, Entity)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Storage for the current state of a bucket's entities.
pub trait ObjectStore: Send + Sync {
    /// The bucket this store serves.
    fn bucket(&self) -> BucketName;

    /// Fetch an entity, failing with [`Error::EntityNotFound`].
    fn get(&self, id: &str) -> Result<Entity>;

    /// Insert or replace an entity.
    ///
    /// `is_indexing` marks writes from bulk remote catch-up rather than a
    /// single live change. It is a hint; stores may ignore it.
    fn update(&self, id: &str, entity: Entity, is_indexing: bool) -> Result<()>;

    /// Remove an entity, returning it if it existed.
    fn remove(&self, id: &str) -> Result<Option<Entity>>;

    fn find(&self, query: &Query) -> Result<Found>;

    fn contains(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    /// Move an entity to a new id. Returns the moved entity.
    fn rename(&self, old_id: &str, new_id: &str) -> Result<Option<Entity>> {
        match self.remove(old_id)? {
            Some(entity) => {
                self.update(new_id, entity.clone(), false)?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }
}

/// In-memory object store for a single bucket.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: BucketName,
    objects: DashMap<EntityId, Entity>,
}

impl MemoryObjectStore {
    pub fn new(bucket: BucketName) -> Self {
        Self {
            bucket,
            objects: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> BucketName {
        self.bucket
    }

    fn get(&self, id: &str) -> Result<Entity> {
        self.objects
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))
    }

    fn update(&self, id: &str, entity: Entity, _is_indexing: bool) -> Result<()> {
        if entity.bucket() != self.bucket {
            return Err(Error::BucketMismatch {
                id: id.to_string(),
                expected: self.bucket,
            });
        }
        self.objects.insert(id.to_string(), entity);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.objects.remove(id).map(|(_, entity)| entity))
    }

    fn find(&self, query: &Query) -> Result<Found> {
        let entries = self
            .objects
            .iter()
            .filter(|e| query.matches(e.key(), e.value()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        Ok(Found::new(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Note, Tag};

    fn note(content: &str, deleted: bool) -> Entity {
        Entity::Note(Note {
            content: content.into(),
            deleted,
            ..Note::default()
        })
    }

    fn test_store() -> MemoryObjectStore {
        let store = MemoryObjectStore::new(BucketName::Note);
        store.update("n2", note("two", false), false).unwrap();
        store.update("n1", note("one", false), false).unwrap();
        store.update("n3", note("trashed", true), false).unwrap();
        store
    }

    #[test]
    fn get_missing() {
        let store = MemoryObjectStore::new(BucketName::Note);
        assert_eq!(
            store.get("nope"),
            Err(Error::EntityNotFound("nope".into()))
        );
        assert!(!store.contains("nope"));
    }

    #[test]
    fn update_replaces() {
        let store = test_store();
        store.update("n1", note("uno", false), false).unwrap();
        assert_eq!(store.get("n1").unwrap(), note("uno", false));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn update_rejects_other_bucket() {
        let store = MemoryObjectStore::new(BucketName::Note);
        let result = store.update("t1", Entity::Tag(Tag::named("x")), false);
        assert!(matches!(result, Err(Error::BucketMismatch { .. })));
    }

    #[test]
    fn remove_returns_entity() {
        let store = test_store();
        assert_eq!(store.remove("n1").unwrap(), Some(note("one", false)));
        assert_eq!(store.remove("n1").unwrap(), None);
    }

    #[test]
    fn find_all_skips_trash() {
        let store = test_store();
        let found = store.find(&Query::all()).unwrap();
        assert_eq!(found.ids(), vec!["n1", "n2"]);

        let found = store.find(&Query::all().include_trashed()).unwrap();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn find_by_ids() {
        let store = test_store();
        let found = store.find(&Query::ids(["n2", "n9"])).unwrap();
        assert_eq!(found.ids(), vec!["n2"]);
    }

    #[test]
    fn found_is_a_restartable_snapshot() {
        let store = test_store();
        let found = store.find(&Query::all()).unwrap();
        store.remove("n1").unwrap();

        assert_eq!(found.iter().count(), 2);
        assert_eq!(found.iter().count(), 2);
        let owned: Vec<_> = found.into_iter().map(|(id, _)| id).collect();
        assert_eq!(owned, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[test]
    fn rename_moves_entity() {
        let store = test_store();
        let moved = store.rename("n1", "srv1").unwrap();
        assert_eq!(moved, Some(note("one", false)));
        assert!(!store.contains("n1"));
        assert_eq!(store.get("srv1").unwrap(), note("one", false));

        assert_eq!(store.rename("missing", "x").unwrap(), None);
    }
}
