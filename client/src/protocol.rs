//! Messages exchanged with the surrounding application.
//!
//! Intents come in, events go out. Both are JSON-encoded with a `type` tag
//! and snake_case names.

use crate::remote::Revision;
use notesync_engine::{BucketName, Entity, EntityId, Note, NotePatch};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Note flags toggled by [`Intent::SetFlag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    Pinned,
    Markdown,
    Published,
    /// Moved to (true) or restored from (false) the trash
    Trashed,
}

/// Local mutation or read requested by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    /// Create a note; a temporary id is generated when none is given.
    Create {
        #[serde(default)]
        id: Option<EntityId>,
        #[serde(default)]
        note: NotePatch,
    },
    Edit {
        id: EntityId,
        changes: NotePatch,
    },
    SetFlag {
        id: EntityId,
        flag: Flag,
        value: bool,
    },
    /// A complete note brought in from outside, already under its id
    Import {
        id: EntityId,
        note: Note,
    },
    RestoreRevision {
        id: EntityId,
        note: Note,
    },
    /// Delete forever
    Delete {
        id: EntityId,
    },
    AddTag {
        note_id: EntityId,
        tag_name: String,
    },
    RemoveTag {
        note_id: EntityId,
        tag_name: String,
    },
    SetPreferences {
        changes: Map<String, Value>,
    },
    Select {
        #[serde(default)]
        id: Option<EntityId>,
    },
    Filter {
        #[serde(default)]
        next_note: Option<EntityId>,
    },
    Logout,
}

/// Connection status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal
    Unauthorized,
}

/// Reconciled state pushed back to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    EntityUpdated {
        bucket: BucketName,
        id: EntityId,
        entity: Entity,
        from_remote: bool,
    },
    EntityDeletedConfirmed {
        bucket: BucketName,
        id: EntityId,
    },
    /// A temporary id was replaced by the remote's confirmed id
    IdRenamed {
        bucket: BucketName,
        old_id: EntityId,
        new_id: EntityId,
    },
    /// Revisions sorted by ascending version
    RevisionsLoaded {
        id: EntityId,
        revisions: Vec<Revision>,
    },
    ConnectionStatusChanged {
        state: ConnectionState,
    },
    Unauthorized,
    AccountName {
        name: String,
    },
}
