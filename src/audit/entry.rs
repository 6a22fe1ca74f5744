//! Audit entry data structures
//!
//! One entry per mutation that a restore applied to the directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::diff::diff_summary;
use crate::models::{ResourceKey, ResourceRecord, ResourceType, RestoreRunId, SnapshotId};

/// Types of operations that can be audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "CREATE"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the mutation was applied (UTC)
    pub timestamp: DateTime<Utc>,

    /// Restore run that applied it
    pub run_id: RestoreRunId,

    /// Snapshot the restored state came from
    pub snapshot_id: SnapshotId,

    pub operation: Operation,

    pub resource_type: ResourceType,

    pub resource_id: String,

    /// Human-readable label (user name, group name, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// State at the target before the mutation (updates and deletes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,

    /// State written by the mutation (creates and updates)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<String>,
}

impl AuditEntry {
    fn base(
        run_id: RestoreRunId,
        snapshot_id: SnapshotId,
        operation: Operation,
        key: ResourceKey,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id,
            snapshot_id,
            operation,
            resource_type: key.resource_type,
            resource_id: key.id,
            label: None,
            before: None,
            after: None,
            diff_summary: None,
        }
    }

    pub fn create(run_id: RestoreRunId, snapshot_id: SnapshotId, record: &ResourceRecord) -> Self {
        Self {
            label: Some(record.label()),
            after: serde_json::to_value(record).ok(),
            ..Self::base(run_id, snapshot_id, Operation::Create, record.key())
        }
    }

    pub fn update(
        run_id: RestoreRunId,
        snapshot_id: SnapshotId,
        before: &ResourceRecord,
        after: &ResourceRecord,
    ) -> Self {
        Self {
            label: Some(after.label()),
            before: serde_json::to_value(before).ok(),
            after: serde_json::to_value(after).ok(),
            diff_summary: diff_summary(&before.comparable_json(), &after.comparable_json()),
            ..Self::base(run_id, snapshot_id, Operation::Update, after.key())
        }
    }

    /// `before` is the state present at the target, when it was read
    pub fn delete(
        run_id: RestoreRunId,
        snapshot_id: SnapshotId,
        key: ResourceKey,
        before: Option<&ResourceRecord>,
    ) -> Self {
        Self {
            label: before.map(ResourceRecord::label),
            before: before.and_then(|r| serde_json::to_value(r).ok()),
            ..Self::base(run_id, snapshot_id, Operation::Delete, key)
        }
    }

    /// Format the entry for human-readable output
    pub fn format_human_readable(&self) -> String {
        let mut output = format!(
            "[{}] {} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.operation,
            self.resource_type,
            self.resource_id
        );

        if let Some(label) = &self.label {
            output.push_str(&format!(" ({})", label));
        }

        if let Some(diff) = &self.diff_summary {
            output.push_str(&format!("\n  Changes: {}", diff));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Group, User};

    #[test]
    fn test_create_entry() {
        let user: ResourceRecord = User::new("u-1", "alice", "Alice").into();
        let entry = AuditEntry::create(RestoreRunId::new(), SnapshotId::new(), &user);

        assert_eq!(entry.operation, Operation::Create);
        assert_eq!(entry.resource_type, ResourceType::User);
        assert_eq!(entry.resource_id, "u-1");
        assert!(entry.before.is_none());
        assert_eq!(entry.after.as_ref().unwrap()["user_name"], "alice");
    }

    #[test]
    fn test_update_entry_carries_diff() {
        let before: ResourceRecord = Group::new("g-1", "Ops").with_members(["u-1"]).into();
        let after: ResourceRecord = Group::new("g-1", "Ops").with_members(["u-1", "u-2"]).into();

        let entry = AuditEntry::update(RestoreRunId::new(), SnapshotId::new(), &before, &after);
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(entry.diff_summary.as_deref(), Some("members: +u-2"));
    }

    #[test]
    fn test_delete_without_known_state() {
        let key = ResourceKey::new(ResourceType::Group, "g-9");
        let entry = AuditEntry::delete(RestoreRunId::new(), SnapshotId::new(), key, None);

        assert_eq!(entry.operation, Operation::Delete);
        assert!(entry.before.is_none());
        assert!(entry.label.is_none());
    }

    #[test]
    fn test_serialization_round_trip() {
        let user: ResourceRecord = User::new("u-1", "alice", "Alice").into();
        let entry = AuditEntry::create(RestoreRunId::new(), SnapshotId::new(), &user);

        let json = serde_json::to_string(&entry).unwrap();
        let back: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, entry.run_id);
        assert_eq!(back.resource_type, ResourceType::User);
    }

    #[test]
    fn test_human_readable_format() {
        let user: ResourceRecord = User::new("u-1", "alice", "Alice").into();
        let formatted =
            AuditEntry::create(RestoreRunId::new(), SnapshotId::new(), &user).format_human_readable();
        assert!(formatted.contains("CREATE user u-1 (alice)"));
    }
}
