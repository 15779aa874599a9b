//! The authoritative remote store.
//!
//! [`Remote`] is the outbound half (requests), [`RemoteEvent`] the inbound
//! half (pushes, acknowledgments, transport state) delivered on a channel.

pub mod loopback;

use crate::error::Result;
use async_trait::async_trait;
use notesync_engine::{BucketName, Change, ChangeId, ChangeVersion, Entity, EntityId, Version};
use serde::{Deserialize, Serialize};

pub use loopback::LoopbackRemote;

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportEvent {
    Connecting,
    Connected,
    Disconnected,
    /// Credentials rejected
    Unauthorized,
}

/// An entity accepted by the remote under its confirmed id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmed {
    pub id: EntityId,
    pub version: Version,
    pub entity: Entity,
}

/// One stored version of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub version: Version,
    pub entity: Entity,
}

/// Inbound traffic from the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// New entity state, from another client or from catch-up
    Push {
        bucket: BucketName,
        id: EntityId,
        version: Version,
        /// `None` when deleted
        entity: Option<Entity>,
        cursor: Option<ChangeVersion>,
        is_indexing: bool,
    },
    /// A transmitted change was applied at `version`
    Ack {
        bucket: BucketName,
        id: EntityId,
        change_id: ChangeId,
        version: Version,
    },
    /// The cursor passed to `subscribe` can no longer be resumed from
    CursorIncompatible { bucket: BucketName },
    /// Every entity of a full index has been pushed
    IndexComplete { bucket: BucketName },
    Transport(TransportEvent),
}

/// Requests to the authoritative remote store.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Create an entity; the remote assigns its id and first version.
    async fn add(&self, bucket: BucketName, entity: Entity) -> Result<Confirmed>;

    /// Transmit a change. The acknowledgment arrives as [`RemoteEvent::Ack`].
    async fn send(&self, bucket: BucketName, change: Change) -> Result<()>;

    /// Stored versions of an entity, in no particular order.
    async fn revisions(&self, bucket: BucketName, id: &str) -> Result<Vec<Revision>>;

    /// Start (or resume after `since`) the bucket's change stream.
    ///
    /// Without a cursor the remote pushes every entity with `is_indexing`,
    /// followed by [`RemoteEvent::IndexComplete`].
    async fn subscribe(&self, bucket: BucketName, since: Option<ChangeVersion>) -> Result<()>;

    async fn account_name(&self) -> Result<String>;

    /// End the session. Further requests fail.
    async fn close(&self);
}
