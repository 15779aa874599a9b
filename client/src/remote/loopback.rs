//! In-process authoritative store.
//!
//! Assigns ids and versions, applies diffs, acknowledges changes and keeps a
//! change log addressable by cursor. Test hooks simulate other clients,
//! dropped connections, lost acknowledgments and revoked credentials.

use super::{Confirmed, Remote, RemoteEvent, Revision, TransportEvent};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use notesync_engine::{
    BucketName, Change, ChangeOp, ChangeVersion, Entity, EntityId, Version,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A request received by the loopback, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Add {
        bucket: BucketName,
        entity: Entity,
    },
    Send {
        bucket: BucketName,
        change: Change,
        at: Instant,
    },
    Revisions {
        bucket: BucketName,
        id: EntityId,
    },
    Subscribe {
        bucket: BucketName,
        since: Option<ChangeVersion>,
    },
    AccountName,
    Close,
}

#[derive(Debug)]
struct LogEntry {
    seq: u64,
    id: EntityId,
    version: Version,
    entity: Option<Entity>,
}

#[derive(Debug, Default)]
struct BucketState {
    objects: BTreeMap<EntityId, Entity>,
    /// Survives deletion so versions keep increasing
    versions: BTreeMap<EntityId, Version>,
    revisions: BTreeMap<EntityId, Vec<Revision>>,
    log: Vec<LogEntry>,
    subscribed: bool,
}

#[derive(Debug)]
struct State {
    buckets: BTreeMap<BucketName, BucketState>,
    next_id: u64,
    seq: u64,
    /// Cursors older than this can no longer be resumed
    compacted_through: u64,
    connected: bool,
    authorized: bool,
    closed: bool,
    holding_acks: bool,
    held: Vec<RemoteEvent>,
    calls: Vec<Call>,
}

impl State {
    fn check(&self) -> Result<()> {
        if !self.authorized {
            return Err(SyncError::Unauthorized);
        }
        if self.closed {
            return Err(SyncError::TransportUnavailable("session closed".into()));
        }
        if !self.connected {
            return Err(SyncError::TransportUnavailable("offline".into()));
        }
        Ok(())
    }

    fn bucket(&mut self, bucket: BucketName) -> &mut BucketState {
        self.buckets.entry(bucket).or_default()
    }

    /// Store a new version of an entity and log it.
    fn record(
        &mut self,
        bucket: BucketName,
        id: &str,
        entity: Option<Entity>,
    ) -> (Version, ChangeVersion) {
        self.seq += 1;
        let seq = self.seq;
        let state = self.bucket(bucket);

        let version = state.versions.get(id).copied().unwrap_or(0) + 1;
        state.versions.insert(id.to_string(), version);
        match &entity {
            Some(entity) => {
                state.objects.insert(id.to_string(), entity.clone());
                state
                    .revisions
                    .entry(id.to_string())
                    .or_default()
                    .push(Revision {
                        version,
                        entity: entity.clone(),
                    });
            }
            None => {
                state.objects.remove(id);
            }
        }
        state.log.push(LogEntry {
            seq,
            id: id.to_string(),
            version,
            entity,
        });

        (version, cursor_token(seq))
    }
}

fn cursor_token(seq: u64) -> ChangeVersion {
    format!("cv{}", seq)
}

fn parse_cursor(cursor: &str) -> Option<u64> {
    cursor.strip_prefix("cv")?.parse().ok()
}

/// A remote living in this process.
#[derive(Debug)]
pub struct LoopbackRemote {
    state: Mutex<State>,
    events: mpsc::UnboundedSender<RemoteEvent>,
    id_prefix: String,
    account: String,
}

impl LoopbackRemote {
    /// A connected remote assigning ids `srv1`, `srv2`, ...
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEvent>) {
        Self::named("srv", "loopback@notesync.local")
    }

    pub fn named(
        id_prefix: impl Into<String>,
        account: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Self {
            state: Mutex::new(State {
                buckets: BTreeMap::new(),
                next_id: 0,
                seq: 0,
                compacted_through: 0,
                connected: true,
                authorized: true,
                closed: false,
                holding_acks: false,
                held: Vec::new(),
                calls: Vec::new(),
            }),
            events: tx,
            id_prefix: id_prefix.into(),
            account: account.into(),
        };
        remote.emit(RemoteEvent::Transport(TransportEvent::Connecting));
        remote.emit(RemoteEvent::Transport(TransportEvent::Connected));
        (Arc::new(remote), rx)
    }

    fn emit(&self, event: RemoteEvent) {
        // A closed receiver means nobody is listening anymore
        let _ = self.events.send(event);
    }

    /// Every request received so far, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Changes received, with the time they arrived.
    pub fn sent(&self) -> Vec<(Instant, BucketName, Change)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Send { bucket, change, at } => Some((*at, *bucket, change.clone())),
                _ => None,
            })
            .collect()
    }

    /// Current stored state of an entity.
    pub fn entity(&self, bucket: BucketName, id: &str) -> Option<(Version, Entity)> {
        let mut state = self.state.lock();
        let bucket = state.bucket(bucket);
        let entity = bucket.objects.get(id)?.clone();
        Some((bucket.versions.get(id).copied().unwrap_or(0), entity))
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Another client writes `entity` (or deletes it with `None`).
    pub fn push_from_peer(
        &self,
        bucket: BucketName,
        id: &str,
        entity: Option<Entity>,
    ) -> Version {
        let mut state = self.state.lock();
        let (version, cursor) = state.record(bucket, id, entity.clone());
        if state.connected && state.bucket(bucket).subscribed {
            self.emit(RemoteEvent::Push {
                bucket,
                id: id.to_string(),
                version,
                entity,
                cursor: Some(cursor),
                is_indexing: false,
            });
        }
        version
    }

    /// Lose the connection. Held acknowledgments are lost with it.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.held.clear();
        self.emit(RemoteEvent::Transport(TransportEvent::Disconnected));
    }

    pub fn restore_connection(&self) {
        self.state.lock().connected = true;
        self.emit(RemoteEvent::Transport(TransportEvent::Connecting));
        self.emit(RemoteEvent::Transport(TransportEvent::Connected));
    }

    /// Reject the session's credentials.
    pub fn revoke(&self) {
        self.state.lock().authorized = false;
        self.emit(RemoteEvent::Transport(TransportEvent::Unauthorized));
    }

    /// Apply changes but keep their acknowledgments back.
    pub fn hold_acks(&self) {
        self.state.lock().holding_acks = true;
    }

    /// Deliver held acknowledgments in order and stop holding.
    pub fn release_acks(&self) {
        let mut state = self.state.lock();
        state.holding_acks = false;
        for ack in std::mem::take(&mut state.held) {
            self.emit(ack);
        }
    }

    /// Forget the change log; older cursors become incompatible.
    pub fn compact_log(&self) {
        let mut state = self.state.lock();
        state.compacted_through = state.seq;
        for bucket in state.buckets.values_mut() {
            bucket.log.clear();
        }
    }
}

#[async_trait]
impl Remote for LoopbackRemote {
    async fn add(&self, bucket: BucketName, entity: Entity) -> Result<Confirmed> {
        let mut state = self.state.lock();
        state.calls.push(Call::Add {
            bucket,
            entity: entity.clone(),
        });
        state.check()?;

        state.next_id += 1;
        let id = format!("{}{}", self.id_prefix, state.next_id);
        let (version, _) = state.record(bucket, &id, Some(entity.clone()));
        tracing::debug!(bucket = %bucket, id = %id, "loopback accepted new entity");

        Ok(Confirmed {
            id,
            version,
            entity,
        })
    }

    async fn send(&self, bucket: BucketName, change: Change) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Send {
            bucket,
            change: change.clone(),
            at: Instant::now(),
        });
        state.check()?;

        let entity = match &change.op {
            ChangeOp::Modify(diff) => {
                let base = match state.bucket(bucket).objects.get(&change.id) {
                    Some(current) => current.to_value()?,
                    None => Value::Object(Map::new()),
                };
                Some(Entity::from_value(bucket, diff.apply(&base))?)
            }
            ChangeOp::Remove => None,
        };

        let (version, _) = state.record(bucket, &change.id, entity);
        let ack = RemoteEvent::Ack {
            bucket,
            id: change.id,
            change_id: change.change_id,
            version,
        };
        if state.holding_acks {
            state.held.push(ack);
        } else {
            self.emit(ack);
        }
        Ok(())
    }

    async fn revisions(&self, bucket: BucketName, id: &str) -> Result<Vec<Revision>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Revisions {
            bucket,
            id: id.to_string(),
        });
        state.check()?;

        // Newest first, like a typical history endpoint
        let mut revisions = state
            .bucket(bucket)
            .revisions
            .get(id)
            .cloned()
            .unwrap_or_default();
        revisions.reverse();
        Ok(revisions)
    }

    async fn subscribe(&self, bucket: BucketName, since: Option<ChangeVersion>) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Subscribe {
            bucket,
            since: since.clone(),
        });
        state.check()?;

        let latest = state.seq;
        let compacted_through = state.compacted_through;
        let bucket_state = state.bucket(bucket);
        bucket_state.subscribed = true;

        match since {
            None => {
                for (id, entity) in &bucket_state.objects {
                    self.emit(RemoteEvent::Push {
                        bucket,
                        id: id.clone(),
                        version: bucket_state.versions.get(id).copied().unwrap_or(1),
                        entity: Some(entity.clone()),
                        cursor: Some(cursor_token(latest)),
                        is_indexing: true,
                    });
                }
                self.emit(RemoteEvent::IndexComplete { bucket });
            }
            Some(cursor) => match parse_cursor(&cursor) {
                Some(seq) if seq >= compacted_through && seq <= latest => {
                    for entry in bucket_state.log.iter().filter(|e| e.seq > seq) {
                        self.emit(RemoteEvent::Push {
                            bucket,
                            id: entry.id.clone(),
                            version: entry.version,
                            entity: entry.entity.clone(),
                            cursor: Some(cursor_token(entry.seq)),
                            is_indexing: false,
                        });
                    }
                }
                _ => {
                    tracing::debug!(bucket = %bucket, cursor = %cursor, "loopback cannot resume cursor");
                    self.emit(RemoteEvent::CursorIncompatible { bucket });
                }
            },
        }
        Ok(())
    }

    async fn account_name(&self) -> Result<String> {
        let mut state = self.state.lock();
        state.calls.push(Call::AccountName);
        state.check()?;
        Ok(self.account.clone())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.calls.push(Call::Close);
        state.closed = true;
        state.connected = false;
    }
}
