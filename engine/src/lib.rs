//! # Notesync Engine
//!
//! The deterministic core of the note synchronization engine.
//!
//! This crate holds everything that decides *what* has to be synchronized:
//! entity models, ghosts, the local object stores, the pending-change ledger,
//! field diffs and the reconciliation of remote pushes and acknowledgments.
//! Deciding *when* (timers, connections, transport) lives in `notesync-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, sockets or clocks
//! - **Deterministic**: same stores + same inputs produce the same outputs
//! - **Shareable**: every store is `Send + Sync` and keyed by entity id, so
//!   local intents and remote pushes can interleave without a global lock
//!
//! ## Core Concepts
//!
//! ### Buckets and entities
//!
//! A [`BucketName`] names a collection synchronized as a unit (`note`, `tag`,
//! `preferences`). Each bucket holds [`Entity`] values keyed by [`EntityId`].
//!
//! ### Ghosts
//!
//! A [`Ghost`] is the last version/snapshot of an entity acknowledged by the
//! remote. Outbound changes are diffs against the ghost. A missing ghost is a
//! normal first-sync state (`version = 0`, no snapshot).
//!
//! ### Pending changes
//!
//! The [`PendingLedger`] tracks at most one in-flight [`ChangeId`] per entity.
//! Acknowledgments for any other change id are stale and ignored.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] combines a bucket's ghost store, object store and ledger
//! to prepare outbound changes and to apply remote pushes and acknowledgments.
//! Remote pushes replace the whole entity (last writer wins).
//!
//! ## Quick Start
//!
//! ```rust
//! use notesync_engine::{
//!     BucketName, Entity, MemoryGhostStore, MemoryObjectStore, Note, ObjectStore,
//!     PendingLedger, Prepared, Reconciler,
//! };
//!
//! let ghosts = MemoryGhostStore::new();
//! let objects = MemoryObjectStore::new(BucketName::Note);
//! let ledger = PendingLedger::new();
//!
//! let mut note = Note::new(1_700_000_000.0);
//! note.content = "hello".into();
//! objects.update("n1", Entity::Note(note), false).unwrap();
//!
//! let reconciler = Reconciler::new(&ghosts, &objects, &ledger);
//! let prepared = reconciler.prepare_touch("n1").unwrap();
//! assert!(matches!(prepared, Prepared::Send(_)));
//! assert!(ledger.is_pending("n1"));
//! ```
//!
//! ## Persistence
//!
//! [`SyncSnapshot`] captures ghosts, cursors and cached entities per bucket
//! and serializes them to JSON with deterministic ordering.

pub mod change;
pub mod diff;
pub mod entity;
pub mod error;
pub mod ghost;
pub mod ledger;
pub mod object_store;
pub mod reconcile;
pub mod snapshot;
pub mod tag_index;

// Re-export main types at crate root
pub use change::{Change, ChangeOp};
pub use diff::{Diff, FieldOp};
pub use entity::{BucketName, Entity, Note, NotePatch, Preferences, SystemTag, Tag};
pub use error::Error;
pub use ghost::{Ghost, GhostStore, MemoryGhostStore};
pub use ledger::{PendingChange, PendingLedger};
pub use object_store::{Found, MemoryObjectStore, ObjectStore, Query};
pub use reconcile::{AckOutcome, Prepared, PushOutcome, Reconciler, RemoteUpdate};
pub use snapshot::{BucketSnapshot, SyncSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use tag_index::{IndexedTagStore, TagIndex};

/// Type aliases for clarity
pub type EntityId = String;
pub type Version = u64;
pub type ChangeId = String;
pub type ChangeVersion = String;
