//! Pending-change ledger.
//!
//! Tracks the single change per entity that has been transmitted and is
//! awaiting acknowledgment. An acknowledgment only clears the entry when its
//! change id matches; anything else is stale and leaves the ledger untouched.

use crate::{ChangeId, Entity, EntityId, Version};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A transmitted change awaiting acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub entity_id: EntityId,
    pub change_id: ChangeId,
    /// Ghost version the change was computed against
    pub base_version: Version,
    /// State the remote will hold once acknowledged; `None` for a removal
    pub target: Option<Entity>,
}

impl PendingChange {
    pub fn is_removal(&self) -> bool {
        self.target.is_none()
    }
}

/// At most one outstanding change per entity.
#[derive(Debug, Default)]
pub struct PendingLedger {
    pending: DashMap<EntityId, PendingChange>,
    /// Entities touched again while their change was in flight
    deferred: DashSet<EntityId>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transmitted change and return its fresh change id.
    ///
    /// Replaces (supersedes) any change already pending for the entity.
    pub fn submit(&self, id: &str, base_version: Version, target: Option<Entity>) -> ChangeId {
        let change_id = Uuid::new_v4().to_string();
        self.pending.insert(
            id.to_string(),
            PendingChange {
                entity_id: id.to_string(),
                change_id: change_id.clone(),
                base_version,
                target,
            },
        );
        change_id
    }

    /// Clear the pending change if `change_id` is the one being tracked.
    ///
    /// Returns `None` for stale or duplicate acknowledgments.
    pub fn acknowledge(&self, id: &str, change_id: &str) -> Option<PendingChange> {
        self.pending
            .remove_if(id, |_, pending| pending.change_id == change_id)
            .map(|(_, pending)| pending)
    }

    pub fn pending(&self, id: &str) -> Option<PendingChange> {
        self.pending.get(id).map(|p| p.value().clone())
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Remember that the entity changed again while a change was in flight.
    pub fn defer(&self, id: &str) {
        self.deferred.insert(id.to_string());
    }

    /// Consume the deferred marker. Returns whether one was set.
    pub fn take_deferred(&self, id: &str) -> bool {
        self.deferred.remove(id).is_some()
    }

    /// Drop everything tracked for an entity.
    pub fn forget(&self, id: &str) -> Option<PendingChange> {
        self.deferred.remove(id);
        self.pending.remove(id).map(|(_, pending)| pending)
    }

    /// All pending changes, ordered by entity id.
    pub fn entries(&self) -> Vec<PendingChange> {
        let mut entries: Vec<PendingChange> =
            self.pending.iter().map(|p| p.value().clone()).collect();
        entries.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&self) {
        self.pending.clear();
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tag;

    #[test]
    fn submit_and_acknowledge() {
        let ledger = PendingLedger::new();
        let target = Some(Entity::Tag(Tag::named("Work")));
        let ccid = ledger.submit("t1", 2, target.clone());

        let pending = ledger.pending("t1").unwrap();
        assert_eq!(pending.change_id, ccid);
        assert_eq!(pending.base_version, 2);
        assert!(!pending.is_removal());

        let acked = ledger.acknowledge("t1", &ccid).unwrap();
        assert_eq!(acked.target, target);
        assert!(ledger.is_empty());
    }

    #[test]
    fn stale_ack_is_ignored() {
        let ledger = PendingLedger::new();
        let first = ledger.submit("n1", 0, None);
        let second = ledger.submit("n1", 0, None);
        assert_ne!(first, second);
        assert_eq!(ledger.len(), 1);

        assert!(ledger.acknowledge("n1", &first).is_none());
        assert_eq!(ledger.pending("n1").unwrap().change_id, second);

        // Duplicate ack after the real one
        assert!(ledger.acknowledge("n1", &second).is_some());
        assert!(ledger.acknowledge("n1", &second).is_none());
    }

    #[test]
    fn ack_for_unknown_entity() {
        let ledger = PendingLedger::new();
        assert!(ledger.acknowledge("nope", "ccid").is_none());
    }

    #[test]
    fn deferred_marker_is_consumed_once() {
        let ledger = PendingLedger::new();
        ledger.defer("n1");
        assert!(ledger.take_deferred("n1"));
        assert!(!ledger.take_deferred("n1"));
    }

    #[test]
    fn forget_clears_both() {
        let ledger = PendingLedger::new();
        ledger.submit("n1", 1, None);
        ledger.defer("n1");

        assert!(ledger.forget("n1").is_some());
        assert!(!ledger.is_pending("n1"));
        assert!(!ledger.take_deferred("n1"));
    }

    #[test]
    fn entries_sorted_and_clear() {
        let ledger = PendingLedger::new();
        ledger.submit("b", 0, None);
        ledger.submit("a", 0, None);

        let ids: Vec<_> = ledger.entries().into_iter().map(|p| p.entity_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        ledger.clear();
        assert!(ledger.is_empty());
    }
}
