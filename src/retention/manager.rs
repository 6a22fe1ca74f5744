//! Retention enforcement
//!
//! Decides which snapshots survive a policy and prunes the rest: manifests
//! first (incrementals before their base), then every chunk the pruned
//! manifests referenced that no surviving manifest still needs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::policy::RetentionPolicy;
use crate::cancel::CancelToken;
use crate::models::{RunStatus, SnapshotId};
use crate::error::VaultResult;
use crate::storage::{ChunkHash, Manifest, SnapshotKind, StorageEngine};

/// Why a snapshot is being pruned
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PruneReason {
    /// A full snapshot no rule selected
    OutsidePolicy,
    BasePruned { base: SnapshotId },
    BaseMissing { base: Option<SnapshotId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneDecision {
    pub snapshot_id: SnapshotId,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    pub reason: PruneReason,
}

/// What a policy would do, computed without touching storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionPlan {
    /// Newest first
    pub retained: Vec<SnapshotId>,
    /// Incrementals first, then full snapshots; newest first within each
    pub pruned: Vec<PruneDecision>,
}

impl RetentionPlan {
    pub fn is_noop(&self) -> bool {
        self.pruned.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub retained: Vec<SnapshotId>,
    pub pruned: Vec<SnapshotId>,
    pub chunks_deleted: usize,
}

impl RetentionReport {
    pub fn status(&self) -> RunStatus {
        RunStatus::Succeeded
    }

    pub fn summary(&self) -> String {
        format!(
            "Retention: {} snapshot(s) retained, {} pruned, {} chunk(s) deleted",
            self.retained.len(),
            self.pruned.len(),
            self.chunks_deleted
        )
    }
}

pub struct RetentionManager {
    store: Arc<StorageEngine>,
}

impl RetentionManager {
    pub fn new(store: Arc<StorageEngine>) -> Self {
        Self { store }
    }

    /// Evaluate `policy` against the stored snapshots
    pub async fn plan(
        &self,
        policy: &RetentionPolicy,
        cancel: &CancelToken,
    ) -> VaultResult<RetentionPlan> {
        policy.validate()?;
        let manifests = self.store.list_manifests_complete(cancel).await?;
        Ok(evaluate(policy, &manifests))
    }

    /// Apply `policy`, deleting pruned snapshots and the chunks only they used
    pub async fn enforce(
        &self,
        policy: &RetentionPolicy,
        cancel: &CancelToken,
    ) -> VaultResult<RetentionReport> {
        policy.validate()?;
        let manifests = self.store.list_manifests_complete(cancel).await?;
        let plan = evaluate(policy, &manifests);
        let by_id: BTreeMap<SnapshotId, &Manifest> =
            manifests.iter().map(|m| (m.snapshot_id, m)).collect();

        let mut touched: HashSet<ChunkHash> = HashSet::new();
        let mut pruned = Vec::with_capacity(plan.pruned.len());
        for decision in &plan.pruned {
            cancel.check()?;
            if let Some(manifest) = by_id.get(&decision.snapshot_id) {
                touched.extend(manifest.chunk_hashes().copied());
            }
            self.store
                .delete_manifest(&decision.snapshot_id, cancel)
                .await?;
            info!(
                snapshot = %decision.snapshot_id,
                kind = %decision.kind,
                "Pruned snapshot ({:?})",
                decision.reason
            );
            pruned.push(decision.snapshot_id);
        }

        let chunks_deleted = if touched.is_empty() {
            0
        } else {
            self.store.collect_garbage(touched, cancel).await?
        };

        let report = RetentionReport {
            retained: plan.retained,
            pruned,
            chunks_deleted,
        };
        info!("{}", report.summary());
        Ok(report)
    }
}

/// Pure retention decision over a set of manifests
pub fn evaluate(policy: &RetentionPolicy, manifests: &[Manifest]) -> RetentionPlan {
    let mut sorted: Vec<&Manifest> = manifests.iter().collect();
    sorted.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.snapshot_id.cmp(&a.snapshot_id))
    });

    let fulls: Vec<(SnapshotId, DateTime<Utc>)> = sorted
        .iter()
        .filter(|m| m.kind == SnapshotKind::Full)
        .map(|m| (m.snapshot_id, m.created_at))
        .collect();
    let full_ids: BTreeSet<SnapshotId> = fulls.iter().map(|(id, _)| *id).collect();
    let keep = policy.select(&fulls);

    let mut plan = RetentionPlan::default();
    let mut pruned_fulls = Vec::new();
    for manifest in sorted {
        let reason = match manifest.kind {
            SnapshotKind::Full if keep.contains(&manifest.snapshot_id) => None,
            SnapshotKind::Full => Some(PruneReason::OutsidePolicy),
            SnapshotKind::Incremental => match manifest.base_snapshot_id {
                Some(base) if keep.contains(&base) => None,
                Some(base) if full_ids.contains(&base) => Some(PruneReason::BasePruned { base }),
                base => Some(PruneReason::BaseMissing { base }),
            },
        };

        match reason {
            None => plan.retained.push(manifest.snapshot_id),
            Some(reason) => {
                debug!(snapshot = %manifest.snapshot_id, "Retention prunes snapshot: {:?}", reason);
                let decision = PruneDecision {
                    snapshot_id: manifest.snapshot_id,
                    kind: manifest.kind,
                    created_at: manifest.created_at,
                    reason,
                };
                if manifest.kind == SnapshotKind::Full {
                    pruned_fulls.push(decision);
                } else {
                    plan.pruned.push(decision);
                }
            }
        }
    }
    plan.pruned.extend(pruned_fulls);
    plan
}
