//! # Notesync Client
//!
//! Keeps notes, tags and preferences synchronized with an authoritative
//! remote while the user edits locally.
//!
//! The [`Coordinator`] takes [`Intent`]s from the application and
//! [`RemoteEvent`]s from a [`Remote`], decides when each entity has to be
//! synchronized and emits reconciled state as [`Event`]s. What has to be sent
//! is decided by `notesync-engine`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use notesync_client::{Config, Coordinator, Intent, LoopbackRemote};
//!
//! # async fn run() -> notesync_client::error::Result<()> {
//! let (remote, remote_events) = LoopbackRemote::new();
//! let (coordinator, mut events) = Coordinator::new(Config::default(), remote, None);
//! coordinator.spawn_remote_loop(remote_events);
//! coordinator.start().await?;
//!
//! coordinator.dispatch(Intent::Create {
//!     id: Some("draft".into()),
//!     note: Default::default(),
//! });
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod monitor;
pub mod persistence;
pub mod protocol;
pub mod remote;

pub use bucket::Bucket;
pub use config::Config;
pub use coordinator::{Coordinator, PREFERENCES_ID};
pub use debounce::Debouncer;
pub use error::SyncError;
pub use monitor::ConnectionMonitor;
pub use persistence::{JsonFilePersistence, MemoryPersistence, Persistence};
pub use protocol::{ConnectionState, Event, Flag, Intent};
pub use remote::{LoopbackRemote, Remote, RemoteEvent};
