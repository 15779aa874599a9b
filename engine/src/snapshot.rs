//! Snapshot types for persisting and restoring sync state.
//!
//! A snapshot holds, per bucket, the change-version cursor, the ghosts and the
//! cached entities. Pending changes are not persisted: anything unacknowledged
//! at shutdown is recomputed as a diff against the ghost on the next touch.

use crate::{
    error::Result, object_store::Query, BucketName, ChangeVersion, Entity, EntityId, Error,
    Ghost, GhostStore, ObjectStore,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Persisted state of one bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSnapshot {
    pub cursor: Option<ChangeVersion>,
    /// Only ghosts that have been acknowledged at least once
    pub ghosts: BTreeMap<EntityId, Ghost>,
    pub entities: BTreeMap<EntityId, Entity>,
}

impl BucketSnapshot {
    /// Capture the current contents of a bucket's stores.
    pub fn capture(ghosts: &dyn GhostStore, objects: &dyn ObjectStore) -> Result<Self> {
        let ghosts_by_id = ghosts
            .entries()?
            .into_iter()
            .filter(|g| !g.is_empty())
            .map(|g| (g.entity_id.clone(), g))
            .collect();
        let entities = objects
            .find(&Query::all().include_trashed())?
            .into_iter()
            .collect();

        Ok(Self {
            cursor: ghosts.cursor()?,
            ghosts: ghosts_by_id,
            entities,
        })
    }

    /// Load this snapshot into (empty) stores.
    pub fn restore(self, ghosts: &dyn GhostStore, objects: &dyn ObjectStore) -> Result<()> {
        ghosts.set_cursor(self.cursor)?;
        for (id, ghost) in self.ghosts {
            ghosts.put(&id, ghost.version, ghost.snapshot)?;
        }
        for (id, entity) in self.entities {
            objects.update(&id, entity, true)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_none() && self.ghosts.is_empty() && self.entities.is_empty()
    }
}

/// A point-in-time snapshot of every bucket.
///
/// Uses BTreeMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub format_version: u32,
    pub buckets: BTreeMap<BucketName, BucketSnapshot>,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSnapshot {
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            buckets: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, bucket: BucketName, snapshot: BucketSnapshot) {
        self.buckets.insert(bucket, snapshot);
    }

    pub fn bucket(&self, bucket: BucketName) -> Option<&BucketSnapshot> {
        self.buckets.get(&bucket)
    }

    /// Remove and return a bucket's state.
    pub fn take(&mut self, bucket: BucketName) -> Option<BucketSnapshot> {
        self.buckets.remove(&bucket)
    }

    pub fn entity_count(&self) -> usize {
        self.buckets.values().map(|b| b.entities.len()).sum()
    }

    /// Check that every ghost and entity is filed under the right id and bucket.
    pub fn validate(&self) -> Result<()> {
        for (bucket, state) in &self.buckets {
            for (id, ghost) in &state.ghosts {
                if &ghost.entity_id != id {
                    return Err(Error::InvalidSnapshot(format!(
                        "ghost '{}' filed under '{}'",
                        ghost.entity_id, id
                    )));
                }
                if let Some(snapshot) = &ghost.snapshot {
                    if snapshot.bucket() != *bucket {
                        return Err(Error::BucketMismatch {
                            id: id.clone(),
                            expected: *bucket,
                        });
                    }
                }
            }
            for (id, entity) in &state.entities {
                if entity.bucket() != *bucket {
                    return Err(Error::BucketMismatch {
                        id: id.clone(),
                        expected: *bucket,
                    });
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::UnsupportedSnapshotVersion {
                found: snapshot.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}
