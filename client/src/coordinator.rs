//! Sync coordinator.
//!
//! Consumes local intents and remote events, drives the debounce scheduler
//! and the buckets, and emits reconciled state to the application.
//!
//! Every decision is made synchronously in [`Coordinator::dispatch`] and
//! [`Coordinator::handle_remote`]; network calls run on spawned tasks and
//! report back through remote events.

use crate::bucket::Bucket;
use crate::config::Config;
use crate::debounce::Debouncer;
use crate::error::Result;
use crate::monitor::ConnectionMonitor;
use crate::persistence::Persistence;
use crate::protocol::{ConnectionState, Event, Flag, Intent};
use crate::remote::{Confirmed, Remote, RemoteEvent, TransportEvent};
use notesync_engine::{
    AckOutcome, BucketName, Entity, EntityId, Error as EngineError, IndexedTagStore,
    MemoryGhostStore, MemoryObjectStore, Note, NotePatch, ObjectStore, Preferences, Prepared,
    PushOutcome, Query, RemoteUpdate, SyncSnapshot, SystemTag, Tag, TagIndex, Version,
};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Id of the single preferences entity.
pub const PREFERENCES_ID: &str = "preferences-key";

const WELCOME_CONTENT: &str = "Welcome to notesync!\n\n\
Notes you write here are kept in sync across all your devices, even when \
you edit offline for a while.\n\n\
Add a tag to this note to see tags appear in the tag list.";

/// Debounce registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Entity(BucketName, EntityId),
    Persist,
}

impl TimerKey {
    pub fn entity(bucket: BucketName, id: &str) -> Self {
        TimerKey::Entity(bucket, id.to_string())
    }
}

fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn bucket(objects: Arc<dyn ObjectStore>, remote: &Arc<dyn Remote>) -> Bucket {
    Bucket::new(
        Arc::new(MemoryGhostStore::new()),
        objects,
        Arc::clone(remote),
    )
}

/// Orchestrates the note, tag and preferences buckets.
pub struct Coordinator {
    config: Config,
    remote: Arc<dyn Remote>,
    notes: Bucket,
    tags: Bucket,
    preferences: Bucket,
    tag_index: Arc<TagIndex>,
    debouncer: Debouncer<TimerKey>,
    monitor: ConnectionMonitor,
    persistence: Option<Arc<dyn Persistence>>,
    events: mpsc::UnboundedSender<Event>,
    last_opened: RwLock<Option<EntityId>>,
    logged_out: AtomicBool,
}

impl Coordinator {
    /// Create a coordinator and the receiving end of its event stream.
    pub fn new(
        config: Config,
        remote: Arc<dyn Remote>,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();

        let tag_store = Arc::new(IndexedTagStore::new());
        let tag_index = Arc::clone(tag_store.index());
        let notes = bucket(Arc::new(MemoryObjectStore::new(BucketName::Note)), &remote);
        let tags = bucket(tag_store, &remote);
        let preferences = bucket(
            Arc::new(MemoryObjectStore::new(BucketName::Preferences)),
            &remote,
        );

        let coordinator = Self {
            config,
            remote,
            notes,
            tags,
            preferences,
            tag_index,
            debouncer: Debouncer::new(),
            monitor: ConnectionMonitor::new(),
            persistence,
            events,
            last_opened: RwLock::new(None),
            logged_out: AtomicBool::new(false),
        };
        (Arc::new(coordinator), rx)
    }

    /// Install the callback fired once on logout or rejected credentials.
    pub fn on_logout(&self, callback: impl FnOnce() + Send + 'static) {
        self.monitor.set_logout(callback);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bucket(&self, name: BucketName) -> &Bucket {
        match name {
            BucketName::Note => &self.notes,
            BucketName::Tag => &self.tags,
            BucketName::Preferences => &self.preferences,
        }
    }

    pub fn entity(&self, bucket: BucketName, id: &str) -> Option<Entity> {
        self.bucket(bucket).objects().get(id).ok()
    }

    pub fn note(&self, id: &str) -> Option<Note> {
        self.load_note(id).ok().flatten()
    }

    /// Id of the tag named `name`, ignoring case.
    pub fn tag_id(&self, name: &str) -> Option<EntityId> {
        self.tag_index.lookup(name)
    }

    pub fn tag_index(&self) -> &Arc<TagIndex> {
        &self.tag_index
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.monitor.subscribe()
    }

    /// Whether a debounced sync is armed for the entity.
    pub fn is_scheduled(&self, bucket: BucketName, id: &str) -> bool {
        self.debouncer.is_armed(&TimerKey::entity(bucket, id))
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::Acquire)
    }

    /// Capture ghosts, cursors and entities of every bucket.
    pub fn snapshot(&self) -> Result<SyncSnapshot> {
        let mut snapshot = SyncSnapshot::new();
        for name in BucketName::ALL {
            snapshot.insert(name, self.bucket(name).capture()?);
        }
        Ok(snapshot)
    }

    /// Restore saved state, subscribe every bucket and greet the account.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("starting sync");

        if let Some(persistence) = &self.persistence {
            match persistence.load().await {
                Ok(Some(snapshot)) => self.restore(snapshot)?,
                Ok(None) => debug!("no saved sync state"),
                Err(e) => error!(error = %e, "could not load sync state, starting fresh"),
            }
        }

        let subscriptions = BucketName::ALL
            .iter()
            .map(|name| self.bucket(*name).subscribe());
        let results = futures::future::join_all(subscriptions).await;
        for (name, result) in BucketName::ALL.iter().zip(results) {
            if let Err(e) = result {
                warn!(bucket = %name, error = %e, "subscribe failed, retried on reconnect");
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.remote.account_name().await {
                Ok(name) => {
                    info!(account = %name, "authenticated");
                    this.emit(Event::AccountName { name });
                }
                Err(e) => warn!(error = %e, "could not fetch account name"),
            }
        });

        // Only a brand new account gets the welcome note
        let fresh = self
            .notes
            .objects()
            .find(&Query::all().include_trashed())?
            .is_empty();
        if self.config.welcome_note && fresh {
            self.dispatch(Intent::Create {
                id: None,
                note: NotePatch::content(WELCOME_CONTENT),
            });
        }
        Ok(())
    }

    fn restore(&self, mut snapshot: SyncSnapshot) -> Result<()> {
        let count = snapshot.entity_count();
        for name in BucketName::ALL {
            let Some(state) = snapshot.take(name) else {
                continue;
            };
            let bucket = self.bucket(name);
            bucket.restore(state)?;
            for (id, entity) in bucket.objects().find(&Query::all().include_trashed())? {
                self.emit_local(name, &id, entity);
            }
        }
        info!(entities = count, "restored sync state");
        Ok(())
    }

    /// Save state now, cancelling any debounced save.
    pub async fn shutdown(&self) -> Result<()> {
        self.debouncer.cancel(&TimerKey::Persist);
        self.persist().await?;
        info!("sync stopped");
        Ok(())
    }

    /// Feed remote events into [`Coordinator::handle_remote`] until the
    /// channel closes, the coordinator is dropped or the session ends.
    pub fn spawn_remote_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RemoteEvent>,
    ) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = this.upgrade() else {
                    break;
                };
                if this.is_logged_out() {
                    break;
                }
                this.handle_remote(event);
            }
            debug!("remote event loop stopped");
        })
    }

    // ------------------------------------------------------------------
    // Local intents
    // ------------------------------------------------------------------

    /// Apply a local intent. Never fails; errors are logged.
    pub fn dispatch(self: &Arc<Self>, intent: Intent) {
        if self.is_logged_out() {
            debug!("session ended, ignoring intent");
            return;
        }

        let result = match intent {
            Intent::Create { id, note } => self.create_note(id, note),
            Intent::Edit { id, changes } => self.edit_note(&id, &changes),
            Intent::SetFlag { id, flag, value } => self.set_flag(&id, flag, value),
            Intent::Import { id, note } | Intent::RestoreRevision { id, note } => {
                self.replace_note(&id, note)
            }
            Intent::Delete { id } => self.delete_note(&id),
            Intent::AddTag { note_id, tag_name } => self.add_tag(&note_id, &tag_name),
            Intent::RemoveTag { note_id, tag_name } => self.remove_tag(&note_id, &tag_name),
            Intent::SetPreferences { changes } => self.set_preferences(&changes),
            Intent::Select { id } => {
                if let Some(id) = &id {
                    *self.last_opened.write() = Some(id.clone());
                }
                self.load_revisions(id);
                Ok(())
            }
            Intent::Filter { next_note } => {
                self.load_revisions(next_note);
                Ok(())
            }
            Intent::Logout => {
                self.logout();
                return;
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "intent failed");
        }
        self.schedule_persist();
    }

    fn load_note(&self, id: &str) -> Result<Option<Note>> {
        match self.notes.objects().get(id) {
            Ok(Entity::Note(note)) => Ok(Some(note)),
            Ok(_) => Err(EngineError::InvalidEntity(format!("'{}' is not a note", id)).into()),
            Err(EngineError::EntityNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_note(&self, id: &str, note: Note) -> Result<()> {
        let entity = Entity::Note(note);
        self.notes.objects().update(id, entity.clone(), false)?;
        self.emit_local(BucketName::Note, id, entity);
        Ok(())
    }

    fn create_note(self: &Arc<Self>, id: Option<EntityId>, patch: NotePatch) -> Result<()> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut note = Note::new(now());
        patch.apply_to(&mut note);
        self.ensure_tags(&note.tags)?;

        let entity = Entity::Note(note);
        self.notes.objects().update(&id, entity.clone(), false)?;
        *self.last_opened.write() = Some(id.clone());
        debug!(id = %id, "created note locally");

        self.emit_local(BucketName::Note, &id, entity.clone());
        self.spawn_add(BucketName::Note, id, entity);
        Ok(())
    }

    fn edit_note(self: &Arc<Self>, id: &str, changes: &NotePatch) -> Result<()> {
        let mut note = self.load_note(id)?.unwrap_or_else(|| Note::new(now()));
        changes.apply_to(&mut note);
        if changes.modification_date.is_none() {
            note.modification_date = now();
        }
        self.ensure_tags(&note.tags)?;
        self.store_note(id, note)?;
        self.schedule_touch(BucketName::Note, id, self.config.edit_debounce);
        Ok(())
    }

    fn set_flag(self: &Arc<Self>, id: &str, flag: Flag, value: bool) -> Result<()> {
        let Some(mut note) = self.load_note(id)? else {
            debug!(id = %id, "flag change for unknown note");
            return Ok(());
        };

        let changed = match flag {
            Flag::Pinned => note.set_system_tag(SystemTag::Pinned, value),
            Flag::Markdown => note.set_system_tag(SystemTag::Markdown, value),
            Flag::Published => note.set_system_tag(SystemTag::Published, value),
            Flag::Trashed => {
                let changed = note.deleted != value;
                note.deleted = value;
                changed
            }
        };
        if !changed {
            return Ok(());
        }

        self.store_note(id, note)?;
        self.schedule_touch(BucketName::Note, id, self.config.flag_delay);
        Ok(())
    }

    /// Import or revision restore: the whole note is replaced.
    fn replace_note(self: &Arc<Self>, id: &str, note: Note) -> Result<()> {
        self.ensure_tags(&note.tags)?;
        self.store_note(id, note)?;
        self.schedule_touch(BucketName::Note, id, self.config.flag_delay);
        Ok(())
    }

    fn delete_note(self: &Arc<Self>, id: &str) -> Result<()> {
        self.debouncer.cancel(&TimerKey::entity(BucketName::Note, id));
        self.notes.objects().remove(id)?;

        if self.notes.forget_unconfirmed(id) {
            debug!(id = %id, "deleted note never reached the remote");
            return Ok(());
        }
        self.spawn_remove(BucketName::Note, id.to_string());
        Ok(())
    }

    fn add_tag(self: &Arc<Self>, note_id: &str, tag_name: &str) -> Result<()> {
        let Some(mut note) = self.load_note(note_id)? else {
            debug!(id = %note_id, "tag added to unknown note");
            return Ok(());
        };

        let changed = note.add_tag(tag_name);
        match self.tag_index.lookup(tag_name) {
            Some(tag_id) => {
                self.schedule_touch(BucketName::Tag, &tag_id, self.config.edit_debounce)
            }
            None => {
                self.create_tag(tag_name)?;
            }
        }

        if changed {
            self.store_note(note_id, note)?;
        }
        self.schedule_touch(BucketName::Note, note_id, self.config.edit_debounce);
        Ok(())
    }

    fn remove_tag(self: &Arc<Self>, note_id: &str, tag_name: &str) -> Result<()> {
        let Some(mut note) = self.load_note(note_id)? else {
            debug!(id = %note_id, "tag removed from unknown note");
            return Ok(());
        };

        let changed = note.remove_tag(tag_name);
        if let Some(tag_id) = self.tag_index.lookup(tag_name) {
            self.schedule_touch(BucketName::Tag, &tag_id, self.config.edit_debounce);
        }

        if changed {
            self.store_note(note_id, note)?;
        }
        self.schedule_touch(BucketName::Note, note_id, self.config.edit_debounce);
        Ok(())
    }

    fn set_preferences(self: &Arc<Self>, changes: &Map<String, Value>) -> Result<()> {
        let mut preferences = match self.preferences.objects().get(PREFERENCES_ID) {
            Ok(Entity::Preferences(preferences)) => preferences,
            Ok(_) | Err(EngineError::EntityNotFound(_)) => Preferences::default(),
            Err(e) => return Err(e.into()),
        };
        preferences.merge(changes)?;

        let entity = Entity::Preferences(preferences);
        self.preferences
            .objects()
            .update(PREFERENCES_ID, entity.clone(), false)?;
        self.emit_local(BucketName::Preferences, PREFERENCES_ID, entity);
        self.schedule_touch(
            BucketName::Preferences,
            PREFERENCES_ID,
            self.config.edit_debounce,
        );
        Ok(())
    }

    /// Create a tag entity for every name the index does not know yet.
    fn ensure_tags(self: &Arc<Self>, names: &[String]) -> Result<()> {
        for name in names {
            if !self.tag_index.contains(name) {
                self.create_tag(name)?;
            }
        }
        Ok(())
    }

    fn create_tag(self: &Arc<Self>, name: &str) -> Result<EntityId> {
        let id = Uuid::new_v4().to_string();
        let entity = Entity::Tag(Tag::named(name));
        self.tags.objects().update(&id, entity.clone(), false)?;
        debug!(id = %id, name = %name, "created tag locally");

        self.emit_local(BucketName::Tag, &id, entity.clone());
        self.spawn_add(BucketName::Tag, id.clone(), entity);
        Ok(id)
    }

    fn load_revisions(self: &Arc<Self>, id: Option<EntityId>) {
        let Some(id) = id.or_else(|| self.last_opened.read().clone()) else {
            return;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.notes.revisions(&id).await {
                Ok(revisions) => {
                    debug!(id = %id, count = revisions.len(), "revisions loaded");
                    this.emit(Event::RevisionsLoaded { id, revisions });
                }
                Err(e) => warn!(id = %id, error = %e, "could not load revisions"),
            }
        });
    }

    fn logout(self: &Arc<Self>) {
        info!("logging out");
        self.end_session();

        let remote = Arc::clone(&self.remote);
        tokio::spawn(async move { remote.close().await });
        self.monitor.fire_logout();
    }

    /// Stop all sync activity. In-flight acknowledgments are dropped.
    fn end_session(&self) {
        self.logged_out.store(true, Ordering::Release);
        self.debouncer.cancel_all();
        for name in BucketName::ALL {
            self.bucket(name).clear_pending();
        }
    }

    // ------------------------------------------------------------------
    // Outbound work
    // ------------------------------------------------------------------

    fn schedule_touch(self: &Arc<Self>, bucket: BucketName, id: &str, delay: Duration) {
        let this = Arc::downgrade(self);
        let id = id.to_string();
        self.debouncer
            .schedule(TimerKey::entity(bucket, &id), delay, move || async move {
                if let Some(this) = this.upgrade() {
                    this.touch(bucket, &id).await;
                }
            });
    }

    fn spawn_touch(self: &Arc<Self>, bucket: BucketName, id: EntityId) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.touch(bucket, &id).await });
    }

    async fn touch(&self, bucket: BucketName, id: &str) {
        if self.is_logged_out() {
            return;
        }
        match self.bucket(bucket).touch(id).await {
            Ok(Prepared::Send(change)) => {
                debug!(bucket = %bucket, id = %id, ccid = %change.change_id, "change transmitted")
            }
            Ok(Prepared::Missing) => debug!(bucket = %bucket, id = %id, "touched entity is gone"),
            Ok(_) => {}
            Err(e) => warn!(bucket = %bucket, id = %id, error = %e, "sync failed"),
        }
    }

    fn spawn_add(self: &Arc<Self>, bucket: BucketName, temp_id: EntityId, entity: Entity) {
        self.bucket(bucket).begin_create(&temp_id);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.bucket(bucket).add(&temp_id, entity).await {
                Ok(confirmed) => {
                    if let Err(e) = this.confirm_created(bucket, &temp_id, confirmed) {
                        warn!(bucket = %bucket, id = %temp_id, error = %e, "could not apply confirmation");
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(bucket = %bucket, id = %temp_id, error = %e, "add failed, retried on reconnect")
                }
                Err(e) => warn!(bucket = %bucket, id = %temp_id, error = %e, "add failed"),
            }
        });
    }

    fn confirm_created(
        self: &Arc<Self>,
        bucket: BucketName,
        temp_id: &str,
        confirmed: Confirmed,
    ) -> Result<()> {
        if self.is_logged_out() {
            return Ok(());
        }

        let had_timer = self.debouncer.cancel(&TimerKey::entity(bucket, temp_id));
        let Some(local) = self.bucket(bucket).finish_create(temp_id, &confirmed)? else {
            debug!(bucket = %bucket, id = %confirmed.id, "deleted before creation was confirmed");
            self.spawn_remove(bucket, confirmed.id);
            return Ok(());
        };

        info!(bucket = %bucket, old_id = %temp_id, new_id = %confirmed.id, "creation confirmed");
        if temp_id != confirmed.id {
            {
                let mut opened = self.last_opened.write();
                if opened.as_deref() == Some(temp_id) {
                    *opened = Some(confirmed.id.clone());
                }
            }
            self.emit(Event::IdRenamed {
                bucket,
                old_id: temp_id.to_string(),
                new_id: confirmed.id.clone(),
            });
        }
        self.emit_local(bucket, &confirmed.id, local.clone());

        // Edits made while the add was in flight go out under the new id
        if had_timer || local != confirmed.entity {
            self.schedule_touch(bucket, &confirmed.id, self.config.edit_debounce);
        }
        self.schedule_persist();
        Ok(())
    }

    fn spawn_remove(self: &Arc<Self>, bucket: BucketName, id: EntityId) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.bucket(bucket).remove(&id).await {
                Ok(Prepared::Unchanged) => {
                    debug!(bucket = %bucket, id = %id, "removed entity was never synced")
                }
                Ok(_) => {}
                Err(e) => warn!(bucket = %bucket, id = %id, error = %e, "remove failed"),
            }
        });
    }

    // ------------------------------------------------------------------
    // Remote events
    // ------------------------------------------------------------------

    /// Apply one remote event.
    pub fn handle_remote(self: &Arc<Self>, event: RemoteEvent) {
        if self.is_logged_out() {
            return;
        }

        let result = match event {
            RemoteEvent::Push {
                bucket,
                id,
                version,
                entity,
                cursor,
                is_indexing,
            } => self.apply_push(
                bucket,
                RemoteUpdate {
                    id,
                    version,
                    entity,
                    cursor,
                },
                is_indexing,
            ),
            RemoteEvent::Ack {
                bucket,
                id,
                change_id,
                version,
            } => self.apply_ack(bucket, &id, &change_id, version),
            RemoteEvent::CursorIncompatible { bucket } => {
                self.spawn_resync(bucket);
                Ok(())
            }
            RemoteEvent::IndexComplete { bucket } => self.finish_index(bucket),
            RemoteEvent::Transport(event) => {
                self.apply_transport(event);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "failed to apply remote event");
        }
        self.schedule_persist();
    }

    fn apply_push(
        &self,
        bucket: BucketName,
        update: RemoteUpdate,
        is_indexing: bool,
    ) -> Result<()> {
        let id = update.id.clone();
        let version = update.version;

        match self.bucket(bucket).apply_push(update, is_indexing)? {
            PushOutcome::Applied {
                entity,
                had_pending,
            } => {
                debug!(bucket = %bucket, id = %id, version, had_pending, is_indexing, "applied remote update");
                self.emit(Event::EntityUpdated {
                    bucket,
                    id,
                    entity,
                    from_remote: true,
                });
            }
            PushOutcome::Removed { existed } => {
                self.debouncer.cancel(&TimerKey::entity(bucket, &id));
                debug!(bucket = %bucket, id = %id, existed, "entity deleted remotely");
                if existed {
                    self.emit(Event::EntityDeletedConfirmed { bucket, id });
                }
            }
            PushOutcome::AlreadyReflected => {
                debug!(bucket = %bucket, id = %id, version, "remote update already reflected")
            }
        }
        Ok(())
    }

    fn apply_ack(
        self: &Arc<Self>,
        bucket: BucketName,
        id: &str,
        change_id: &str,
        version: Version,
    ) -> Result<()> {
        match self.bucket(bucket).acknowledge(id, change_id, version)? {
            AckOutcome::Applied {
                version,
                deferred,
                restored,
            } => {
                debug!(bucket = %bucket, id = %id, version, deferred, "change acknowledged");
                if let Some(entity) = restored {
                    debug!(bucket = %bucket, id = %id, "acknowledged state replaces an older push");
                    self.emit(Event::EntityUpdated {
                        bucket,
                        id: id.to_string(),
                        entity,
                        from_remote: true,
                    });
                }
                if deferred {
                    self.spawn_touch(bucket, id.to_string());
                }
            }
            AckOutcome::Removed => {
                debug!(bucket = %bucket, id = %id, "removal acknowledged");
                self.emit(Event::EntityDeletedConfirmed {
                    bucket,
                    id: id.to_string(),
                });
            }
            AckOutcome::Stale => {
                debug!(bucket = %bucket, id = %id, ccid = %change_id, "ignoring stale acknowledgment")
            }
        }
        Ok(())
    }

    fn finish_index(&self, bucket: BucketName) -> Result<()> {
        for id in self.bucket(bucket).finish_index()? {
            self.debouncer.cancel(&TimerKey::entity(bucket, &id));
            debug!(bucket = %bucket, id = %id, "entity missing from index");
            self.emit(Event::EntityDeletedConfirmed { bucket, id });
        }
        Ok(())
    }

    fn apply_transport(self: &Arc<Self>, event: TransportEvent) {
        let Some(transition) = self.monitor.observe(event) else {
            return;
        };
        self.emit(Event::ConnectionStatusChanged {
            state: transition.to,
        });

        match transition.to {
            ConnectionState::Unauthorized => {
                warn!("credentials rejected, ending session");
                self.emit(Event::Unauthorized);
                self.end_session();
            }
            ConnectionState::Connected if transition.reconnect => {
                let this = Arc::clone(self);
                tokio::spawn(this.resume());
            }
            _ => {}
        }
    }

    /// Catch up after a reconnect: resume streams from their cursors, resend
    /// changes whose acknowledgments were lost, retry failed adds.
    async fn resume(self: Arc<Self>) {
        info!("connection restored, resuming buckets");
        for name in BucketName::ALL {
            let bucket = self.bucket(name);
            if let Err(e) = bucket.subscribe().await {
                warn!(bucket = %name, error = %e, "resubscribe failed");
                continue;
            }

            match bucket.resend_pending().await {
                Ok(0) => {}
                Ok(resent) => info!(bucket = %name, resent, "resent pending changes"),
                Err(e) => warn!(bucket = %name, error = %e, "resend failed"),
            }

            for temp_id in bucket.take_unconfirmed() {
                match bucket.objects().get(&temp_id) {
                    Ok(entity) => self.spawn_add(name, temp_id, entity),
                    Err(_) => debug!(bucket = %name, id = %temp_id, "unconfirmed entity is gone"),
                }
            }
        }
    }

    fn spawn_resync(self: &Arc<Self>, bucket: BucketName) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.bucket(bucket).resync().await {
                warn!(bucket = %bucket, error = %e, "resync failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn schedule_persist(self: &Arc<Self>) {
        if self.persistence.is_none() || self.is_logged_out() {
            return;
        }
        let this = Arc::downgrade(self);
        self.debouncer
            .schedule(TimerKey::Persist, self.config.persist_delay, move || async move {
                if let Some(this) = this.upgrade() {
                    if let Err(e) = this.persist().await {
                        error!(error = %e, "failed to save sync state");
                    }
                }
            });
    }

    async fn persist(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let snapshot = self.snapshot()?;
        persistence.save(&snapshot).await
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    fn emit_local(&self, bucket: BucketName, id: &str, entity: Entity) {
        self.emit(Event::EntityUpdated {
            bucket,
            id: id.to_string(),
            entity,
            from_remote: false,
        });
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("notes", &self.notes)
            .field("tags", &self.tags)
            .field("preferences", &self.preferences)
            .field("connection", &self.monitor.state())
            .field("timers", &self.debouncer.armed())
            .field("logged_out", &self.is_logged_out())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::LoopbackRemote;

    fn coordinator() -> (Arc<Coordinator>, mpsc::UnboundedReceiver<Event>) {
        let (remote, _remote_events) = LoopbackRemote::new();
        Coordinator::new(Config::default(), remote, None)
    }

    #[test]
    fn timer_keys_separate_buckets() {
        assert_ne!(
            TimerKey::entity(BucketName::Note, "x"),
            TimerKey::entity(BucketName::Tag, "x")
        );
        assert_ne!(TimerKey::entity(BucketName::Note, "x"), TimerKey::Persist);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_of_unknown_note_starts_from_defaults() {
        let (coordinator, mut events) = coordinator();
        coordinator.dispatch(Intent::Edit {
            id: "n1".into(),
            changes: NotePatch::content("fresh"),
        });

        let note = coordinator.note("n1").unwrap();
        assert_eq!(note.content, "fresh");
        assert!(!note.deleted);
        assert!(coordinator.is_scheduled(BucketName::Note, "n1"));
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::EntityUpdated { from_remote: false, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn edited_tag_names_get_tag_entities() {
        let (coordinator, _events) = coordinator();
        coordinator.dispatch(Intent::Edit {
            id: "n1".into(),
            changes: NotePatch {
                tags: Some(vec!["Home".into(), "home".into(), "Travel".into()]),
                ..NotePatch::default()
            },
        });

        assert_eq!(coordinator.note("n1").unwrap().tags, vec!["Home", "Travel"]);
        assert!(coordinator.tag_id("HOME").is_some());
        assert!(coordinator.tag_id("travel").is_some());
        assert_eq!(coordinator.tag_index().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trash_flag_sets_deleted() {
        let (coordinator, _events) = coordinator();
        coordinator.dispatch(Intent::Edit {
            id: "n1".into(),
            changes: NotePatch::content("x"),
        });
        coordinator.dispatch(Intent::SetFlag {
            id: "n1".into(),
            flag: Flag::Trashed,
            value: true,
        });
        assert!(coordinator.note("n1").unwrap().deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn preferences_merge_keeps_unknown_fields() {
        let (coordinator, _events) = coordinator();
        let mut first = Map::new();
        first.insert("theme".into(), Value::from("dark"));
        coordinator.dispatch(Intent::SetPreferences { changes: first });
        let mut second = Map::new();
        second.insert("analyticsEnabled".into(), Value::from(true));
        coordinator.dispatch(Intent::SetPreferences { changes: second });

        let Some(Entity::Preferences(preferences)) =
            coordinator.entity(BucketName::Preferences, PREFERENCES_ID)
        else {
            panic!("preferences missing");
        };
        assert_eq!(preferences.analytics_enabled, Some(true));
        assert_eq!(preferences.extra.get("theme"), Some(&Value::from("dark")));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_ignores_later_intents() {
        let (coordinator, _events) = coordinator();
        coordinator.dispatch(Intent::Logout);
        coordinator.dispatch(Intent::Edit {
            id: "n1".into(),
            changes: NotePatch::content("late"),
        });
        assert!(coordinator.is_logged_out());
        assert_eq!(coordinator.note("n1"), None);
    }
}
