//! Core data models for idvault
//!
//! This module contains the data structures that represent the identity
//! directory: users, groups, permission sets, assignments, tombstones and
//! the typed sets that snapshots are made of.

pub mod ids;
pub mod resource;
pub mod resource_set;

pub use ids::{RestoreRunId, SnapshotId};
pub use resource::{
    Assignment, Group, PermissionSet, PrincipalKind, ResourceKey, ResourceRecord, ResourceType,
    Tombstone, User,
};
pub use resource_set::ResourceSet;

use serde::{Deserialize, Serialize};

/// Overall outcome of a backup, restore or retention run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Finished, but some items were skipped or deferred
    SucceededWithSkips,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::SucceededWithSkips => write!(f, "succeeded with skips"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}
