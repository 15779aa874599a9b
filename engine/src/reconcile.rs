//! Reconciliation of local changes, remote pushes and acknowledgments.
//!
//! This is the core of the engine. A [`Reconciler`] borrows one bucket's
//! ghost store, object store and pending ledger and decides:
//!
//! 1. What to transmit for a local touch (a diff against the ghost), or
//!    whether to hold it back because a change is already in flight
//! 2. How a remote push lands: whole-entity replacement, last writer wins,
//!    ignored when the ghost already reflects that version
//! 3. How an acknowledgment advances the ghost, ignoring stale change ids
//!
//! Ghost versions only move forward through this module.

use crate::{
    error::Result, ChangeId, ChangeVersion, Change, Diff, Entity, EntityId, Error, GhostStore,
    ObjectStore, PendingLedger, Version,
};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// An entity state pushed by the remote (another client's edit or catch-up).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUpdate {
    pub id: EntityId,
    pub version: Version,
    /// New state; `None` when the entity was deleted remotely
    pub entity: Option<Entity>,
    /// Stream position after this update
    pub cursor: Option<ChangeVersion>,
}

/// Result of applying a remote push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The entity now holds the pushed state
    Applied {
        entity: Entity,
        /// A local change was still awaiting acknowledgment
        had_pending: bool,
    },
    /// The entity was deleted remotely
    Removed { existed: bool },
    /// The ghost already reflects this version
    AlreadyReflected,
}

/// Result of preparing an outbound change.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    /// Transmit this change; the ledger now tracks it
    Send(Change),
    /// Nothing to transmit
    Unchanged,
    /// A change is already in flight; the touch is re-issued after its ack
    Deferred { in_flight: ChangeId },
    /// The entity is not in the local store
    Missing,
}

/// Result of applying an acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The ghost advanced to `version`
    Applied {
        version: Version,
        /// The entity was touched again while the change was in flight
        deferred: bool,
        /// A push older than this change had overwritten the local entity;
        /// it now holds the acknowledged state again
        restored: Option<Entity>,
    },
    /// A removal was acknowledged; ghost and local entity are gone
    Removed,
    /// Not the tracked change id; nothing changed
    Stale,
}

/// Reconciles one bucket's stores.
pub struct Reconciler<'a> {
    ghosts: &'a dyn GhostStore,
    objects: &'a dyn ObjectStore,
    ledger: &'a PendingLedger,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        ghosts: &'a dyn GhostStore,
        objects: &'a dyn ObjectStore,
        ledger: &'a PendingLedger,
    ) -> Self {
        Self {
            ghosts,
            objects,
            ledger,
        }
    }

    /// Prepare the change that brings the remote up to the local state.
    pub fn prepare_touch(&self, id: &str) -> Result<Prepared> {
        let current = match self.objects.get(id) {
            Ok(entity) => entity,
            Err(Error::EntityNotFound(_)) => return Ok(Prepared::Missing),
            Err(e) => return Err(e),
        };

        if let Some(pending) = self.ledger.pending(id) {
            self.ledger.defer(id);
            return Ok(Prepared::Deferred {
                in_flight: pending.change_id,
            });
        }

        self.prepare_modify(id, current)
    }

    /// Prepare a permanent removal. Supersedes any pending change.
    pub fn prepare_removal(&self, id: &str) -> Result<Prepared> {
        let ghost = self.ghosts.get(id)?;
        if ghost.version == 0 && !self.ledger.is_pending(id) {
            // Never reached the remote: nothing to remove there
            self.ghosts.remove(id)?;
            self.ledger.forget(id);
            return Ok(Prepared::Unchanged);
        }

        let change_id = self.ledger.submit(id, ghost.version, None);
        Ok(Prepared::Send(Change::remove(id, change_id, ghost.version)))
    }

    /// Re-prepare a pending change under a fresh change id.
    ///
    /// Used after a reconnect, when acknowledgments for the old id are lost.
    pub fn prepare_resend(&self, id: &str) -> Result<Prepared> {
        let pending = match self.ledger.forget(id) {
            Some(pending) => pending,
            None => return Ok(Prepared::Unchanged),
        };
        if pending.is_removal() {
            return self.prepare_removal(id);
        }
        match self.objects.get(id) {
            Ok(current) => self.prepare_modify(id, current),
            Err(Error::EntityNotFound(_)) => Ok(Prepared::Missing),
            Err(e) => Err(e),
        }
    }

    fn prepare_modify(&self, id: &str, current: Entity) -> Result<Prepared> {
        let ghost = self.ghosts.get(id)?;
        let base = match &ghost.snapshot {
            Some(snapshot) => snapshot.to_value()?,
            None => Value::Object(Map::new()),
        };

        let diff = Diff::between(&base, &current.to_value()?);
        if diff.is_empty() {
            return Ok(Prepared::Unchanged);
        }

        let change_id = self.ledger.submit(id, ghost.version, Some(current));
        Ok(Prepared::Send(Change::modify(
            id,
            change_id,
            ghost.version,
            diff,
        )))
    }

    /// Apply a remote push: whole-entity replacement, last writer wins.
    ///
    /// Applied even when a local change is pending; that change's ack is
    /// handled independently.
    pub fn apply_push(&self, update: RemoteUpdate, is_indexing: bool) -> Result<PushOutcome> {
        if let Some(cursor) = &update.cursor {
            self.ghosts.set_cursor(Some(cursor.clone()))?;
        }

        let ghost = self.ghosts.get(&update.id)?;
        if !ghost.accepts(update.version) {
            return Ok(PushOutcome::AlreadyReflected);
        }

        match update.entity {
            Some(entity) => {
                if entity.bucket() != self.objects.bucket() {
                    return Err(Error::BucketMismatch {
                        id: update.id,
                        expected: self.objects.bucket(),
                    });
                }
                self.objects
                    .update(&update.id, entity.clone(), is_indexing)?;
                self.ghosts
                    .put(&update.id, update.version, Some(entity.clone()))?;
                Ok(PushOutcome::Applied {
                    entity,
                    had_pending: self.ledger.is_pending(&update.id),
                })
            }
            None => {
                let existed = self.objects.remove(&update.id)?.is_some();
                self.ghosts.remove(&update.id)?;
                self.ledger.forget(&update.id);
                Ok(PushOutcome::Removed { existed })
            }
        }
    }

    /// Apply an acknowledgment for `change_id` at the remote `version`.
    pub fn acknowledge(&self, id: &str, change_id: &str, version: Version) -> Result<AckOutcome> {
        let pending = match self.ledger.acknowledge(id, change_id) {
            Some(pending) => pending,
            None => return Ok(AckOutcome::Stale),
        };

        match pending.target {
            Some(target) => {
                let current = self.ghosts.version(id)?;
                let deferred = self.ledger.take_deferred(id);
                // The remote applied a peer write before ours, and the push
                // for it replaced the local entity
                let overtaken = current > pending.base_version && version > current;

                let mut restored = None;
                if version >= current {
                    self.ghosts.put(id, version, Some(target.clone()))?;
                    if overtaken && !deferred && self.objects.contains(id) {
                        self.objects.update(id, target.clone(), false)?;
                        restored = Some(target);
                    }
                }
                Ok(AckOutcome::Applied {
                    version: version.max(current),
                    deferred,
                    restored,
                })
            }
            None => {
                self.ghosts.remove(id)?;
                self.objects.remove(id)?;
                self.ledger.forget(id);
                Ok(AckOutcome::Removed)
            }
        }
    }

    /// Drop entities a complete re-index did not return.
    ///
    /// Only entities the remote has confirmed before (ghost version above
    /// zero) and with no change in flight are dropped. Returns the removed ids.
    pub fn prune_unseen(&self, seen: &HashSet<EntityId>) -> Result<Vec<EntityId>> {
        let mut removed = Vec::new();
        for ghost in self.ghosts.entries()? {
            if ghost.version == 0
                || seen.contains(&ghost.entity_id)
                || self.ledger.is_pending(&ghost.entity_id)
            {
                continue;
            }
            self.objects.remove(&ghost.entity_id)?;
            self.ghosts.remove(&ghost.entity_id)?;
            removed.push(ghost.entity_id);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BucketName, MemoryGhostStore, MemoryObjectStore, Note, Tag};
    use serde_json::json;

    struct Fixture {
        ghosts: MemoryGhostStore,
        objects: MemoryObjectStore,
        ledger: PendingLedger,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ghosts: MemoryGhostStore::new(),
                objects: MemoryObjectStore::new(BucketName::Note),
                ledger: PendingLedger::new(),
            }
        }

        fn reconciler(&self) -> Reconciler<'_> {
            Reconciler::new(&self.ghosts, &self.objects, &self.ledger)
        }

        fn edit(&self, id: &str, content: &str) {
            self.objects.update(id, note(content), false).unwrap();
        }
    }

    fn note(content: &str) -> Entity {
        Entity::Note(Note {
            content: content.into(),
            ..Note::default()
        })
    }

    fn sent(prepared: Prepared) -> Change {
        match prepared {
            Prepared::Send(change) => change,
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[test]
    fn first_touch_diffs_against_empty_ghost() {
        let fx = Fixture::new();
        fx.edit("n1", "abc");

        let change = sent(fx.reconciler().prepare_touch("n1").unwrap());
        assert_eq!(change.source_version, 0);
        assert_eq!(change.diff().unwrap().value_of("content"), Some(&json!("abc")));
        assert_eq!(fx.ledger.pending("n1").unwrap().change_id, change.change_id);
    }

    #[test]
    fn touch_without_changes_sends_nothing() {
        let fx = Fixture::new();
        fx.edit("n1", "abc");
        fx.ghosts.put("n1", 2, Some(note("abc"))).unwrap();

        assert_eq!(fx.reconciler().prepare_touch("n1").unwrap(), Prepared::Unchanged);
        assert!(fx.ledger.is_empty());
    }

    #[test]
    fn touch_only_sends_changed_fields() {
        let fx = Fixture::new();
        fx.ghosts.put("n1", 2, Some(note("a"))).unwrap();
        fx.edit("n1", "ab");

        let change = sent(fx.reconciler().prepare_touch("n1").unwrap());
        assert_eq!(change.source_version, 2);
        assert_eq!(change.diff().unwrap().fields().collect::<Vec<_>>(), vec!["content"]);
    }

    #[test]
    fn touch_while_pending_is_deferred() {
        let fx = Fixture::new();
        fx.edit("n1", "a");
        let first = sent(fx.reconciler().prepare_touch("n1").unwrap());

        fx.edit("n1", "ab");
        let second = fx.reconciler().prepare_touch("n1").unwrap();
        assert_eq!(
            second,
            Prepared::Deferred {
                in_flight: first.change_id.clone()
            }
        );
        assert_eq!(fx.ledger.len(), 1);

        let ack = fx.reconciler().acknowledge("n1", &first.change_id, 1).unwrap();
        assert_eq!(
            ack,
            AckOutcome::Applied {
                version: 1,
                deferred: true,
                restored: None
            }
        );

        // The follow-up touch carries only what changed since the ack
        let follow_up = sent(fx.reconciler().prepare_touch("n1").unwrap());
        assert_eq!(follow_up.source_version, 1);
        assert_eq!(follow_up.diff().unwrap().value_of("content"), Some(&json!("ab")));
    }

    #[test]
    fn touch_missing_entity() {
        let fx = Fixture::new();
        assert_eq!(fx.reconciler().prepare_touch("nope").unwrap(), Prepared::Missing);
    }

    #[test]
    fn ack_advances_ghost() {
        let fx = Fixture::new();
        fx.edit("n1", "abc");
        let change = sent(fx.reconciler().prepare_touch("n1").unwrap());

        let ack = fx.reconciler().acknowledge("n1", &change.change_id, 1).unwrap();
        assert_eq!(
            ack,
            AckOutcome::Applied {
                version: 1,
                deferred: false,
                restored: None
            }
        );
        let ghost = fx.ghosts.get("n1").unwrap();
        assert_eq!(ghost.version, 1);
        assert_eq!(ghost.snapshot, Some(note("abc")));
        assert!(fx.ledger.is_empty());
    }

    #[test]
    fn stale_ack_changes_nothing() {
        let fx = Fixture::new();
        fx.edit("n1", "abc");
        let change = sent(fx.reconciler().prepare_touch("n1").unwrap());

        let ack = fx.reconciler().acknowledge("n1", "not-the-ccid", 1).unwrap();
        assert_eq!(ack, AckOutcome::Stale);
        assert_eq!(fx.ledger.pending("n1").unwrap().change_id, change.change_id);
        assert_eq!(fx.ghosts.version("n1").unwrap(), 0);
    }

    #[test]
    fn ack_never_regresses_ghost() {
        let fx = Fixture::new();
        fx.edit("n1", "mine");
        let change = sent(fx.reconciler().prepare_touch("n1").unwrap());

        // Another client's edit lands at a higher version first
        fx.reconciler()
            .apply_push(
                RemoteUpdate {
                    id: "n1".into(),
                    version: 5,
                    entity: Some(note("theirs")),
                    cursor: None,
                },
                false,
            )
            .unwrap();

        let ack = fx.reconciler().acknowledge("n1", &change.change_id, 3).unwrap();
        assert_eq!(
            ack,
            AckOutcome::Applied {
                version: 5,
                deferred: false,
                restored: None
            }
        );
        assert_eq!(fx.ghosts.get("n1").unwrap().snapshot, Some(note("theirs")));
    }

    #[test]
    fn ack_after_older_push_restores_acknowledged_state() {
        let fx = Fixture::new();
        fx.ghosts.put("n1", 1, Some(note("base"))).unwrap();
        fx.edit("n1", "mine");
        let change = sent(fx.reconciler().prepare_touch("n1").unwrap());

        // The remote took a peer write at 2, then ours at 3
        fx.reconciler()
            .apply_push(
                RemoteUpdate {
                    id: "n1".into(),
                    version: 2,
                    entity: Some(note("theirs")),
                    cursor: None,
                },
                false,
            )
            .unwrap();
        assert_eq!(fx.objects.get("n1").unwrap(), note("theirs"));

        let ack = fx.reconciler().acknowledge("n1", &change.change_id, 3).unwrap();
        assert_eq!(
            ack,
            AckOutcome::Applied {
                version: 3,
                deferred: false,
                restored: Some(note("mine")),
            }
        );
        let ghost = fx.ghosts.get("n1").unwrap();
        assert_eq!(ghost.version, 3);
        assert_eq!(Some(fx.objects.get("n1").unwrap()), ghost.snapshot);
        assert!(fx.ledger.is_empty());
    }

    #[test]
    fn ack_after_older_push_keeps_newer_local_edit() {
        let fx = Fixture::new();
        fx.ghosts.put("n1", 1, Some(note("base"))).unwrap();
        fx.edit("n1", "mine");
        let change = sent(fx.reconciler().prepare_touch("n1").unwrap());
        fx.reconciler()
            .apply_push(
                RemoteUpdate {
                    id: "n1".into(),
                    version: 2,
                    entity: Some(note("theirs")),
                    cursor: None,
                },
                false,
            )
            .unwrap();

        // Edited on top of the pushed state while our change was in flight
        fx.edit("n1", "theirs, edited");
        fx.reconciler().prepare_touch("n1").unwrap();

        let ack = fx.reconciler().acknowledge("n1", &change.change_id, 3).unwrap();
        assert_eq!(
            ack,
            AckOutcome::Applied {
                version: 3,
                deferred: true,
                restored: None,
            }
        );
        assert_eq!(fx.objects.get("n1").unwrap(), note("theirs, edited"));

        let follow_up = sent(fx.reconciler().prepare_touch("n1").unwrap());
        assert_eq!(follow_up.source_version, 3);
        assert_eq!(
            follow_up.diff().unwrap().value_of("content"),
            Some(&json!("theirs, edited"))
        );
    }

    #[test]
    fn prune_drops_only_confirmed_idle_entities() {
        let fx = Fixture::new();
        for id in ["kept", "gone", "busy"] {
            fx.edit(id, id);
            fx.ghosts.put(id, 2, Some(note(id))).unwrap();
        }
        // Never confirmed by the remote
        fx.edit("draft", "draft");
        fx.edit("busy", "busy, edited");
        sent(fx.reconciler().prepare_touch("busy").unwrap());

        let seen: HashSet<EntityId> = ["kept".to_string()].into_iter().collect();
        let removed = fx.reconciler().prune_unseen(&seen).unwrap();

        assert_eq!(removed, vec!["gone".to_string()]);
        assert!(!fx.objects.contains("gone"));
        assert_eq!(fx.ghosts.version("gone").unwrap(), 0);
        assert!(fx.objects.contains("kept"));
        assert!(fx.objects.contains("busy"));
        assert!(fx.objects.contains("draft"));
    }

    #[test]
    fn push_replaces_whole_entity() {
        let fx = Fixture::new();
        fx.edit("n1", "local");
        fx.reconciler().prepare_touch("n1").unwrap();

        let outcome = fx
            .reconciler()
            .apply_push(
                RemoteUpdate {
                    id: "n1".into(),
                    version: 2,
                    entity: Some(note("remote")),
                    cursor: Some("cv-2".into()),
                },
                false,
            )
            .unwrap();

        assert_eq!(
            outcome,
            PushOutcome::Applied {
                entity: note("remote"),
                had_pending: true
            }
        );
        assert_eq!(fx.objects.get("n1").unwrap(), note("remote"));
        assert_eq!(fx.ghosts.version("n1").unwrap(), 2);
        assert_eq!(fx.ghosts.cursor().unwrap(), Some("cv-2".to_string()));
        // Pending change stays tracked
        assert!(fx.ledger.is_pending("n1"));
    }

    #[test]
    fn push_at_known_version_is_ignored() {
        let fx = Fixture::new();
        fx.ghosts.put("n1", 3, Some(note("seen"))).unwrap();
        fx.edit("n1", "seen");

        let outcome = fx
            .reconciler()
            .apply_push(
                RemoteUpdate {
                    id: "n1".into(),
                    version: 3,
                    entity: Some(note("replayed")),
                    cursor: Some("cv-3".into()),
                },
                true,
            )
            .unwrap();

        assert_eq!(outcome, PushOutcome::AlreadyReflected);
        assert_eq!(fx.objects.get("n1").unwrap(), note("seen"));
        // The cursor still advances
        assert_eq!(fx.ghosts.cursor().unwrap(), Some("cv-3".to_string()));
    }

    #[test]
    fn push_for_other_bucket_is_rejected() {
        let fx = Fixture::new();
        let result = fx.reconciler().apply_push(
            RemoteUpdate {
                id: "t1".into(),
                version: 1,
                entity: Some(Entity::Tag(Tag::named("x"))),
                cursor: None,
            },
            false,
        );
        assert!(matches!(result, Err(Error::BucketMismatch { .. })));
    }

    #[test]
    fn remote_delete_clears_everything() {
        let fx = Fixture::new();
        fx.edit("n1", "a");
        fx.ghosts.put("n1", 1, Some(note("a"))).unwrap();
        fx.ledger.submit("n1", 1, Some(note("a")));

        let outcome = fx
            .reconciler()
            .apply_push(
                RemoteUpdate {
                    id: "n1".into(),
                    version: 2,
                    entity: None,
                    cursor: None,
                },
                false,
            )
            .unwrap();

        assert_eq!(outcome, PushOutcome::Removed { existed: true });
        assert!(!fx.objects.contains("n1"));
        assert!(fx.ghosts.get("n1").unwrap().is_empty());
        assert!(fx.ledger.is_empty());
    }

    #[test]
    fn removal_of_acknowledged_entity() {
        let fx = Fixture::new();
        fx.ghosts.put("n1", 4, Some(note("a"))).unwrap();

        let change = sent(fx.reconciler().prepare_removal("n1").unwrap());
        assert!(change.is_removal());
        assert_eq!(change.source_version, 4);

        let ack = fx.reconciler().acknowledge("n1", &change.change_id, 5).unwrap();
        assert_eq!(ack, AckOutcome::Removed);
        assert!(fx.ghosts.get("n1").unwrap().is_empty());
    }

    #[test]
    fn removal_of_never_synced_entity_is_local() {
        let fx = Fixture::new();
        assert_eq!(fx.reconciler().prepare_removal("n1").unwrap(), Prepared::Unchanged);
        assert!(fx.ledger.is_empty());
    }

    #[test]
    fn removal_supersedes_pending_edit() {
        let fx = Fixture::new();
        fx.edit("n1", "a");
        let edit = sent(fx.reconciler().prepare_touch("n1").unwrap());

        let removal = sent(fx.reconciler().prepare_removal("n1").unwrap());
        assert_ne!(edit.change_id, removal.change_id);
        assert!(fx.ledger.pending("n1").unwrap().is_removal());

        // The old edit's ack is now stale
        let ack = fx.reconciler().acknowledge("n1", &edit.change_id, 1).unwrap();
        assert_eq!(ack, AckOutcome::Stale);
    }

    #[test]
    fn resend_uses_fresh_change_id() {
        let fx = Fixture::new();
        fx.edit("n1", "a");
        let first = sent(fx.reconciler().prepare_touch("n1").unwrap());

        fx.edit("n1", "ab");
        let resent = sent(fx.reconciler().prepare_resend("n1").unwrap());
        assert_ne!(first.change_id, resent.change_id);
        assert_eq!(resent.diff().unwrap().value_of("content"), Some(&json!("ab")));
        assert_eq!(fx.ledger.len(), 1);

        assert_eq!(fx.reconciler().prepare_resend("other").unwrap(), Prepared::Unchanged);
    }
}
