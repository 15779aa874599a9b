//! Outbound change types.
//!
//! A change is what a bucket transmits to the remote: either a field diff
//! against the ghost or a removal, tagged with the change id the remote echoes
//! back in its acknowledgment.

use crate::{ChangeId, Diff, EntityId, Version};
use serde::{Deserialize, Serialize};

/// What the change does to the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Modify(Diff),
    Remove,
}

/// A change transmitted to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Target entity
    pub id: EntityId,
    /// Correlates the change with its acknowledgment
    pub change_id: ChangeId,
    /// Ghost version the diff was computed against
    pub source_version: Version,
    pub op: ChangeOp,
}

impl Change {
    pub fn modify(
        id: impl Into<EntityId>,
        change_id: impl Into<ChangeId>,
        source_version: Version,
        diff: Diff,
    ) -> Self {
        Self {
            id: id.into(),
            change_id: change_id.into(),
            source_version,
            op: ChangeOp::Modify(diff),
        }
    }

    pub fn remove(
        id: impl Into<EntityId>,
        change_id: impl Into<ChangeId>,
        source_version: Version,
    ) -> Self {
        Self {
            id: id.into(),
            change_id: change_id.into(),
            source_version,
            op: ChangeOp::Remove,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self.op, ChangeOp::Remove)
    }

    /// The diff carried by a modification.
    pub fn diff(&self) -> Option<&Diff> {
        match &self.op {
            ChangeOp::Modify(diff) => Some(diff),
            ChangeOp::Remove => None,
        }
    }
}
