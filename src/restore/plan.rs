//! Restore plans
//!
//! A plan is the dependency-ordered list of actions a restore would take,
//! built from the materialized snapshot and the current state of the
//! target. Building it has no side effects.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audit::diff_values;
use crate::error::{VaultError, VaultResult};
use crate::models::{ResourceKey, ResourceRecord, ResourceSet, ResourceType, SnapshotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Skip,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Skip => write!(f, "skip"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// How a divergence between snapshot and target is settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    Overwrite,
    #[default]
    Skip,
    Merge,
    /// Ask the caller's `ConflictResolver` for each conflict
    PromptCaller,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overwrite => write!(f, "overwrite"),
            Self::Skip => write!(f, "skip"),
            Self::Merge => write!(f, "merge"),
            Self::PromptCaller => write!(f, "prompt-caller"),
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "skip" => Ok(Self::Skip),
            "merge" => Ok(Self::Merge),
            "prompt-caller" | "prompt" => Ok(Self::PromptCaller),
            other => Err(format!("unknown conflict strategy: {}", other)),
        }
    }
}

/// Decision taken for one conflict at execution time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    Overwrite,
    Skip,
    Merge,
    DeferredToOperator,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overwrite => write!(f, "overwrite"),
            Self::Skip => write!(f, "skip"),
            Self::Merge => write!(f, "merge"),
            Self::DeferredToOperator => write!(f, "deferred-to-operator"),
        }
    }
}

/// Snapshot and target disagree about a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictEntry {
    pub key: ResourceKey,
    pub existing: ResourceRecord,
    pub incoming: ResourceRecord,
    /// `field: target -> snapshot` lines
    pub differences: Vec<String>,
    /// Strategy that will settle it
    pub strategy: ConflictStrategy,
}

impl ConflictEntry {
    pub fn new(existing: ResourceRecord, incoming: ResourceRecord, strategy: ConflictStrategy) -> Self {
        Self {
            key: incoming.key(),
            differences: diff_values(&existing.comparable_json(), &incoming.comparable_json()),
            existing,
            incoming,
            strategy,
        }
    }
}

/// Execution stage of an action: upserts in tier order, then deletes in
/// reverse tier order
pub fn stage_of(resource_type: ResourceType, action: ActionKind) -> u8 {
    let position = ResourceType::ALL
        .iter()
        .position(|t| *t == resource_type)
        .unwrap_or(0) as u8;
    match action {
        ActionKind::Delete => 4 + (3 - position),
        _ => position,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub key: ResourceKey,
    pub action: ActionKind,
    /// Snapshot state, absent for deletes
    pub incoming: Option<ResourceRecord>,
    /// Target state at planning time
    pub existing: Option<ResourceRecord>,
    pub conflict: Option<ConflictEntry>,
    /// Set when the action cannot run at all
    pub blocked_by: Option<VaultError>,
}

impl PlannedAction {
    pub fn tier(&self) -> u8 {
        self.key.resource_type.tier()
    }

    pub fn stage(&self) -> u8 {
        stage_of(self.key.resource_type, self.action)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_by.is_some()
    }

    /// Identities this action needs to have been applied successfully
    pub fn dependencies(&self) -> Vec<ResourceKey> {
        match (&self.action, &self.incoming) {
            (ActionKind::Delete, _) | (_, None) => Vec::new(),
            (_, Some(record)) => record.references(),
        }
    }

    pub fn describe(&self) -> String {
        let mut line = format!("{:<7} {}", self.action, self.key);
        if let Some(conflict) = &self.conflict {
            line.push_str(&format!(
                " [conflict, {}: {}]",
                conflict.strategy,
                conflict.differences.join(", ")
            ));
        }
        if let Some(reason) = &self.blocked_by {
            line.push_str(&format!(" [blocked: {}]", reason));
        }
        line
    }
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub snapshot_id: SnapshotId,
    /// Ordered by stage, then by identifier
    pub actions: Vec<PlannedAction>,
    pub warnings: Vec<String>,
}

impl RestorePlan {
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.action == kind).count()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &ConflictEntry> {
        self.actions.iter().filter_map(|a| a.conflict.as_ref())
    }

    pub fn blocked(&self) -> impl Iterator<Item = &PlannedAction> {
        self.actions.iter().filter(|a| a.is_blocked())
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Restore plan for {}: {} create, {} update, {} skip, {} delete ({} conflicts, {} blocked)",
            self.snapshot_id,
            self.count(ActionKind::Create),
            self.count(ActionKind::Update),
            self.count(ActionKind::Skip),
            self.count(ActionKind::Delete),
            self.conflicts().count(),
            self.blocked().count()
        )
    }
}

/// Current target state as read during planning, keyed by identity
pub type TargetLookups = HashMap<ResourceKey, VaultResult<Option<ResourceRecord>>>;

/// Turn snapshot contents and target lookups into an ordered plan
pub fn build_plan(
    snapshot_id: SnapshotId,
    resources: &ResourceSet,
    lookups: &TargetLookups,
    strategy: ConflictStrategy,
    warnings: Vec<String>,
) -> RestorePlan {
    let mut actions = Vec::new();

    for record in resources.all_records() {
        let key = record.key();
        let mut planned = match lookups.get(&key) {
            Some(Err(e)) => PlannedAction {
                key,
                action: ActionKind::Create,
                incoming: Some(record.clone()),
                existing: None,
                conflict: None,
                blocked_by: Some(e.clone()),
            },
            Some(Ok(Some(existing))) if existing.same_state(record) => PlannedAction {
                key,
                action: ActionKind::Skip,
                incoming: Some(record.clone()),
                existing: Some(existing.clone()),
                conflict: None,
                blocked_by: None,
            },
            Some(Ok(Some(existing))) => PlannedAction {
                key,
                action: ActionKind::Update,
                incoming: Some(record.clone()),
                existing: Some(existing.clone()),
                conflict: Some(ConflictEntry::new(existing.clone(), record.clone(), strategy)),
                blocked_by: None,
            },
            Some(Ok(None)) | None => PlannedAction {
                key,
                action: ActionKind::Create,
                incoming: Some(record.clone()),
                existing: None,
                conflict: None,
                blocked_by: None,
            },
        };

        if planned.blocked_by.is_none() {
            planned.blocked_by = unresolved_reference(record, resources, lookups);
        }
        actions.push(planned);
    }

    for tombstone in resources.all_tombstones() {
        let key = tombstone.key();
        let planned = match lookups.get(&key) {
            Some(Ok(Some(existing))) => PlannedAction {
                key,
                action: ActionKind::Delete,
                incoming: None,
                existing: Some(existing.clone()),
                conflict: None,
                blocked_by: None,
            },
            Some(Err(e)) => PlannedAction {
                key,
                action: ActionKind::Delete,
                incoming: None,
                existing: None,
                conflict: None,
                blocked_by: Some(e.clone()),
            },
            // Already gone at the target
            Some(Ok(None)) | None => continue,
        };
        actions.push(planned);
    }

    actions.sort_by(|a, b| {
        a.stage()
            .cmp(&b.stage())
            .then_with(|| a.key.id.cmp(&b.key.id))
    });

    RestorePlan {
        snapshot_id,
        actions,
        warnings,
    }
}

fn unresolved_reference(
    record: &ResourceRecord,
    resources: &ResourceSet,
    lookups: &TargetLookups,
) -> Option<VaultError> {
    record.references().into_iter().find_map(|reference| {
        if resources.contains(&reference) {
            return None;
        }
        let reason = match lookups.get(&reference) {
            Some(Ok(Some(_))) => return None,
            Some(Err(e)) => format!("{} could not be read at the target: {}", reference, e),
            Some(Ok(None)) | None => {
                format!("{} is neither in the snapshot nor present at the target", reference)
            }
        };
        Some(VaultError::DependencyUnsatisfied {
            resource: record.key().to_string(),
            reason,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Assignment, Group, PermissionSet, PrincipalKind, Tombstone, User};
    use chrono::Utc;

    fn snapshot_set() -> ResourceSet {
        ResourceSet::from_records([
            ResourceRecord::from(User::new("u-1", "alice", "Alice")),
            Group::new("g-1", "Admins").with_members(["u-1"]).into(),
            PermissionSet::new("ps-1", "Admin").into(),
            Assignment::new(PrincipalKind::Group, "g-1", "ps-1", "111111111111").into(),
        ])
    }

    fn empty_target(set: &ResourceSet) -> TargetLookups {
        set.all_records().map(|r| (r.key(), Ok(None))).collect()
    }

    #[test]
    fn test_plan_orders_by_dependency_tier() {
        let set = snapshot_set();
        let plan = build_plan(
            SnapshotId::new(),
            &set,
            &empty_target(&set),
            ConflictStrategy::Skip,
            Vec::new(),
        );

        let order: Vec<ResourceType> = plan.actions.iter().map(|a| a.key.resource_type).collect();
        assert_eq!(
            order,
            vec![
                ResourceType::User,
                ResourceType::Group,
                ResourceType::PermissionSet,
                ResourceType::Assignment
            ]
        );
        assert_eq!(plan.count(ActionKind::Create), 4);
        assert!(plan.blocked().next().is_none());
    }

    #[test]
    fn test_identical_is_skip_and_different_is_conflict() {
        let set = snapshot_set();
        let mut lookups = empty_target(&set);
        lookups.insert(
            ResourceKey::new(ResourceType::User, "u-1"),
            Ok(Some(User::new("u-1", "alice", "Alice").into())),
        );
        lookups.insert(
            ResourceKey::new(ResourceType::PermissionSet, "ps-1"),
            Ok(Some(PermissionSet::new("ps-1", "ReadOnly").into())),
        );

        let plan = build_plan(SnapshotId::new(), &set, &lookups, ConflictStrategy::Merge, Vec::new());

        assert_eq!(plan.count(ActionKind::Skip), 1);
        assert_eq!(plan.count(ActionKind::Update), 1);
        let conflict = plan.conflicts().next().unwrap();
        assert_eq!(conflict.strategy, ConflictStrategy::Merge);
        assert!(conflict.differences.iter().any(|d| d.starts_with("name")));
    }

    #[test]
    fn test_assignment_with_unknown_principal_is_blocked() {
        let set = ResourceSet::from_records([ResourceRecord::from(Assignment::new(
            PrincipalKind::User,
            "u-gone",
            "ps-1",
            "111111111111",
        ))]);
        let mut lookups = empty_target(&set);
        lookups.insert(ResourceKey::new(ResourceType::User, "u-gone"), Ok(None));
        lookups.insert(
            ResourceKey::new(ResourceType::PermissionSet, "ps-1"),
            Ok(Some(PermissionSet::new("ps-1", "Admin").into())),
        );

        let plan = build_plan(SnapshotId::new(), &set, &lookups, ConflictStrategy::Skip, Vec::new());

        let blocked: Vec<_> = plan.blocked().collect();
        assert_eq!(blocked.len(), 1);
        assert!(matches!(
            blocked[0].blocked_by,
            Some(VaultError::DependencyUnsatisfied { .. })
        ));
    }

    #[test]
    fn test_tombstones_present_at_target_become_deletes_after_upserts() {
        let mut set = snapshot_set();
        for (resource_type, id) in [
            (ResourceType::User, "u-old"),
            (ResourceType::Assignment, "111111111111:ps-1:user:u-old"),
            (ResourceType::Group, "g-gone"),
        ] {
            set.add_tombstone(Tombstone {
                resource_type,
                id: id.into(),
                deleted_at: Utc::now(),
                last_known: None,
            });
        }
        let mut lookups = empty_target(&set);
        lookups.insert(
            ResourceKey::new(ResourceType::User, "u-old"),
            Ok(Some(User::new("u-old", "old", "Old").into())),
        );
        lookups.insert(
            ResourceKey::new(ResourceType::Assignment, "111111111111:ps-1:user:u-old"),
            Ok(Some(
                Assignment::new(PrincipalKind::User, "u-old", "ps-1", "111111111111").into(),
            )),
        );
        lookups.insert(ResourceKey::new(ResourceType::Group, "g-gone"), Ok(None));

        let plan = build_plan(SnapshotId::new(), &set, &lookups, ConflictStrategy::Skip, Vec::new());

        assert_eq!(plan.count(ActionKind::Delete), 2);
        let tail: Vec<ResourceType> = plan
            .actions
            .iter()
            .skip(4)
            .map(|a| a.key.resource_type)
            .collect();
        assert_eq!(tail, vec![ResourceType::Assignment, ResourceType::User]);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "overwrite".parse::<ConflictStrategy>(),
            Ok(ConflictStrategy::Overwrite)
        );
        assert_eq!(
            "prompt_caller".parse::<ConflictStrategy>(),
            Ok(ConflictStrategy::PromptCaller)
        );
        assert!("later".parse::<ConflictStrategy>().is_err());
    }
}
