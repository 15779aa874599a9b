//! Tag name index.
//!
//! Maps a lower-cased tag name to the id of the tag entity carrying it. The
//! [`IndexedTagStore`] keeps the index consistent with the tag collection on
//! every write, so lookups never see a name that is not in the store.

use crate::{
    error::Result,
    object_store::{Found, MemoryObjectStore, ObjectStore, Query},
    BucketName, Entity, EntityId, Error,
};
use dashmap::DashMap;
use std::sync::Arc;

/// Secondary index from lower-cased tag name to tag id.
#[derive(Debug, Default)]
pub struct TagIndex {
    by_name: DashMap<String, EntityId>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalized index key for a display name.
    pub fn key(name: &str) -> String {
        name.to_lowercase()
    }

    /// Id of the tag named `name`, ignoring case.
    pub fn lookup(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(&Self::key(name)).map(|id| id.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(&Self::key(name))
    }

    /// Lower-cased names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn insert(&self, name: &str, id: &str) {
        self.by_name.insert(Self::key(name), id.to_string());
    }

    /// Remove `name` only if it still points at `id`.
    fn remove_if_owned(&self, name: &str, id: &str) {
        self.by_name.remove_if(&Self::key(name), |_, owner| owner == id);
    }

    fn clear(&self) {
        self.by_name.clear();
    }
}

/// Tag bucket store that maintains a [`TagIndex`].
#[derive(Debug)]
pub struct IndexedTagStore {
    tags: MemoryObjectStore,
    index: Arc<TagIndex>,
}

impl Default for IndexedTagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexedTagStore {
    pub fn new() -> Self {
        Self {
            tags: MemoryObjectStore::new(BucketName::Tag),
            index: Arc::new(TagIndex::new()),
        }
    }

    /// Shared handle to the name index.
    pub fn index(&self) -> &Arc<TagIndex> {
        &self.index
    }

    /// `id` no longer carries `name`: hand the name to another tag entity
    /// with the same key, if one exists.
    fn release(&self, name: &str, id: &str) -> Result<()> {
        self.index.remove_if_owned(name, id);
        if self.index.contains(name) {
            return Ok(());
        }

        let key = TagIndex::key(name);
        let survivor = self
            .tags
            .find(&Query::all())?
            .into_iter()
            .find_map(|(other, entity)| match entity {
                Entity::Tag(tag) if other != id && TagIndex::key(&tag.name) == key => {
                    Some((other, tag.name))
                }
                _ => None,
            });
        if let Some((other, name)) = survivor {
            self.index.insert(&name, &other);
        }
        Ok(())
    }

    /// Rebuild the index from the stored tags.
    pub fn reindex(&self) -> Result<()> {
        self.index.clear();
        for (id, entity) in self.tags.find(&Query::all())? {
            if let Entity::Tag(tag) = entity {
                self.index.insert(&tag.name, &id);
            }
        }
        Ok(())
    }
}

impl ObjectStore for IndexedTagStore {
    fn bucket(&self) -> BucketName {
        BucketName::Tag
    }

    fn get(&self, id: &str) -> Result<Entity> {
        self.tags.get(id)
    }

    fn update(&self, id: &str, entity: Entity, is_indexing: bool) -> Result<()> {
        let name = match &entity {
            Entity::Tag(tag) => tag.name.clone(),
            _ => {
                return Err(Error::BucketMismatch {
                    id: id.to_string(),
                    expected: BucketName::Tag,
                })
            }
        };

        let previous = match self.tags.get(id) {
            Ok(Entity::Tag(previous)) => Some(previous.name),
            _ => None,
        };

        self.tags.update(id, entity, is_indexing)?;
        self.index.insert(&name, id);
        if let Some(previous) = previous {
            if TagIndex::key(&previous) != TagIndex::key(&name) {
                self.release(&previous, id)?;
            }
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<Option<Entity>> {
        let removed = self.tags.remove(id)?;
        if let Some(Entity::Tag(tag)) = &removed {
            self.release(&tag.name, id)?;
        }
        Ok(removed)
    }

    fn find(&self, query: &Query) -> Result<Found> {
        self.tags.find(query)
    }
}
