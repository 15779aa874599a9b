//! Error types for the sync engine.

use crate::{BucketName, EntityId};
use thiserror::Error;

/// All possible errors from the sync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Store errors
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("entity '{id}' does not belong to bucket {expected}")]
    BucketMismatch { id: EntityId, expected: BucketName },

    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("unsupported snapshot format version: {found} (max supported: {supported})")]
    UnsupportedSnapshotVersion { found: u32, supported: u32 },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
