//! A bucket bound to the remote.
//!
//! Wraps one bucket's ghost store, object store and pending ledger, turns
//! engine decisions into remote requests and tracks entities whose creation
//! has not been confirmed yet.

use crate::error::{Result, SyncError};
use crate::remote::{Confirmed, Remote, Revision};
use dashmap::DashSet;
use notesync_engine::{
    AckOutcome, BucketName, BucketSnapshot, Entity, EntityId, GhostStore, ObjectStore,
    PendingLedger, Prepared, PushOutcome, Reconciler, RemoteUpdate, Version,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

pub struct Bucket {
    name: BucketName,
    ghosts: Arc<dyn GhostStore>,
    objects: Arc<dyn ObjectStore>,
    ledger: PendingLedger,
    remote: Arc<dyn Remote>,
    /// Temporary ids with an add in flight
    creating: DashSet<EntityId>,
    /// Temporary ids whose add failed while offline
    unconfirmed: DashSet<EntityId>,
    /// Ids pushed since a full index was requested
    indexing: Mutex<Option<HashSet<EntityId>>>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("pending", &self.ledger.len())
            .field("creating", &self.creating.len())
            .field("unconfirmed", &self.unconfirmed.len())
            .field("indexing", &self.indexing.lock().is_some())
            .finish()
    }
}

impl Bucket {
    pub fn new(
        ghosts: Arc<dyn GhostStore>,
        objects: Arc<dyn ObjectStore>,
        remote: Arc<dyn Remote>,
    ) -> Self {
        Self {
            name: objects.bucket(),
            ghosts,
            objects,
            ledger: PendingLedger::new(),
            remote,
            creating: DashSet::new(),
            unconfirmed: DashSet::new(),
            indexing: Mutex::new(None),
        }
    }

    pub fn name(&self) -> BucketName {
        self.name
    }

    pub fn objects(&self) -> &dyn ObjectStore {
        self.objects.as_ref()
    }

    pub fn ghosts(&self) -> &dyn GhostStore {
        self.ghosts.as_ref()
    }

    pub fn ledger(&self) -> &PendingLedger {
        &self.ledger
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(self.ghosts.as_ref(), self.objects.as_ref(), &self.ledger)
    }

    /// Whether the id is still a temporary one awaiting the remote's id.
    pub fn awaiting_confirmation(&self, id: &str) -> bool {
        self.creating.contains(id) || self.unconfirmed.contains(id)
    }

    /// Send the diff between the local entity and its ghost.
    pub async fn touch(&self, id: &str) -> Result<Prepared> {
        if self.awaiting_confirmation(id) {
            tracing::debug!(bucket = %self.name, id = %id, "touch held until creation is confirmed");
            return Ok(Prepared::Unchanged);
        }
        let prepared = self.reconciler().prepare_touch(id)?;
        self.transmit(prepared).await
    }

    /// Remove the entity remotely. Local state is dropped on acknowledgment.
    pub async fn remove(&self, id: &str) -> Result<Prepared> {
        let prepared = self.reconciler().prepare_removal(id)?;
        self.transmit(prepared).await
    }

    async fn transmit(&self, prepared: Prepared) -> Result<Prepared> {
        let change = match &prepared {
            Prepared::Send(change) => change.clone(),
            Prepared::Deferred { in_flight } => {
                tracing::debug!(bucket = %self.name, ccid = %in_flight, "change in flight, touch deferred");
                return Ok(prepared);
            }
            Prepared::Unchanged | Prepared::Missing => return Ok(prepared),
        };

        tracing::debug!(
            bucket = %self.name,
            id = %change.id,
            ccid = %change.change_id,
            source_version = change.source_version,
            removal = change.is_removal(),
            "sending change"
        );
        match self.remote.send(self.name, change.clone()).await {
            Ok(()) => Ok(prepared),
            Err(e) if e.is_transient() => {
                // Stays in the ledger and is resent on reconnect
                tracing::warn!(bucket = %self.name, id = %change.id, error = %e, "change not sent");
                Ok(prepared)
            }
            Err(e) => {
                self.ledger.acknowledge(&change.id, &change.change_id);
                Err(e)
            }
        }
    }

    /// Mark `temp_id` as awaiting confirmation before its add is sent.
    pub fn begin_create(&self, temp_id: &str) {
        self.unconfirmed.remove(temp_id);
        self.creating.insert(temp_id.to_string());
    }

    /// Create the entity remotely.
    ///
    /// `temp_id` stays tracked until [`Bucket::finish_create`] or, after a
    /// transient failure, until the add is retried.
    pub async fn add(&self, temp_id: &str, entity: Entity) -> Result<Confirmed> {
        match self.remote.add(self.name, entity).await {
            Ok(confirmed) => Ok(confirmed),
            Err(e) => {
                self.creating.remove(temp_id);
                if e.is_transient() {
                    self.unconfirmed.insert(temp_id.to_string());
                }
                Err(e)
            }
        }
    }

    /// Move a confirmed entity from its temporary id to the remote's id.
    ///
    /// Returns the local entity now stored under the confirmed id, or `None`
    /// when it was deleted locally before the confirmation arrived.
    pub fn finish_create(&self, temp_id: &str, confirmed: &Confirmed) -> Result<Option<Entity>> {
        self.creating.remove(temp_id);
        self.mark_seen(&confirmed.id);
        self.ghosts
            .put(&confirmed.id, confirmed.version, Some(confirmed.entity.clone()))?;
        if temp_id != confirmed.id {
            self.ghosts.remove(temp_id)?;
        }
        Ok(self.objects.rename(temp_id, &confirmed.id)?)
    }

    /// Drop tracking of an unconfirmed id. Returns whether it was tracked.
    pub fn forget_unconfirmed(&self, id: &str) -> bool {
        self.unconfirmed.remove(id).is_some()
    }

    /// Temporary ids whose add should be retried.
    pub fn take_unconfirmed(&self) -> Vec<EntityId> {
        let ids: Vec<EntityId> = self.unconfirmed.iter().map(|id| id.key().clone()).collect();
        for id in &ids {
            self.unconfirmed.remove(id);
        }
        ids
    }

    pub fn apply_push(&self, update: RemoteUpdate, is_indexing: bool) -> Result<PushOutcome> {
        self.mark_seen(&update.id);
        Ok(self.reconciler().apply_push(update, is_indexing)?)
    }

    pub fn acknowledge(&self, id: &str, change_id: &str, version: Version) -> Result<AckOutcome> {
        self.mark_seen(id);
        Ok(self.reconciler().acknowledge(id, change_id, version)?)
    }

    /// Resume the change stream from the stored cursor.
    pub async fn subscribe(&self) -> Result<()> {
        let cursor = self.ghosts.cursor()?;
        tracing::debug!(bucket = %self.name, cursor = ?cursor, "subscribing");
        match cursor {
            Some(cursor) => self.remote.subscribe(self.name, Some(cursor)).await,
            None => self.index().await,
        }
    }

    /// Discard the cursor and re-index the whole bucket.
    pub async fn resync(&self) -> Result<()> {
        self.ghosts.set_cursor(None)?;
        tracing::info!(bucket = %self.name, "cursor discarded, re-indexing bucket");
        self.index().await
    }

    /// The remote vouched for `id` while a full index is running.
    fn mark_seen(&self, id: &str) {
        if let Some(seen) = self.indexing.lock().as_mut() {
            seen.insert(id.to_string());
        }
    }

    async fn index(&self) -> Result<()> {
        *self.indexing.lock() = Some(HashSet::new());
        let result = self.remote.subscribe(self.name, None).await;
        if result.is_err() {
            *self.indexing.lock() = None;
        }
        result
    }

    /// End a full index: drop confirmed entities the remote no longer has.
    ///
    /// Returns the removed ids. Entities with a change in flight are kept.
    pub fn finish_index(&self) -> Result<Vec<EntityId>> {
        let Some(seen) = self.indexing.lock().take() else {
            return Ok(Vec::new());
        };
        let removed = self.reconciler().prune_unseen(&seen)?;
        if !removed.is_empty() {
            tracing::info!(bucket = %self.name, removed = removed.len(), "dropped entities missing from index");
        }
        Ok(removed)
    }

    /// Resend every pending change under a fresh change id.
    ///
    /// Acknowledgments for the old ids were lost with the connection.
    pub async fn resend_pending(&self) -> Result<usize> {
        let mut sent = 0;
        for pending in self.ledger.entries() {
            let prepared = self.reconciler().prepare_resend(&pending.entity_id)?;
            if let Prepared::Send(_) = self.transmit(prepared).await? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Revisions sorted by ascending version.
    pub async fn revisions(&self, id: &str) -> Result<Vec<Revision>> {
        let mut revisions = self.remote.revisions(self.name, id).await?;
        revisions.sort_by_key(|r| r.version);
        Ok(revisions)
    }

    pub fn capture(&self) -> Result<BucketSnapshot> {
        Ok(BucketSnapshot::capture(
            self.ghosts.as_ref(),
            self.objects.as_ref(),
        )?)
    }

    pub fn restore(&self, snapshot: BucketSnapshot) -> Result<()> {
        snapshot
            .restore(self.ghosts.as_ref(), self.objects.as_ref())
            .map_err(SyncError::from)
    }

    /// Abandon everything in flight.
    pub fn clear_pending(&self) {
        self.ledger.clear();
        self.creating.clear();
        self.unconfirmed.clear();
    }
}
