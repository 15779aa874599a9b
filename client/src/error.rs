//! Unified error handling for the sync client.

use crate::config::ConfigError;
use notesync_engine::BucketName;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The remote cannot be reached right now; retried on reconnect
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Credentials were rejected; the session is over
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Change cursor for bucket {0} is no longer valid")]
    CursorIncompatible(BucketName),

    #[error("Engine error: {0}")]
    Engine(#[from] notesync_engine::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Whether the operation may succeed once the connection is back.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransportUnavailable(_))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, SyncError>;
