//! Backup manager for idvault
//!
//! Drives one backup through `Idle → Collecting → Serializing → Storing →
//! Validating → Completed | Failed`. A manifest is only written once every
//! chunk it references has been read back and verified, so a failed or
//! cancelled run leaves nothing but unreferenced chunks behind.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{error, info, warn};

use super::loader::{MaterializedSnapshot, SnapshotLoader};
use super::payload::TypePayload;
use super::validation::{validate_snapshot, ValidationReport};
use crate::cancel::CancelToken;
use crate::collector::{CollectionOutcome, CollectionWindow, Collector};
use crate::error::{VaultError, VaultResult};
use crate::models::{ResourceSet, ResourceType, RunStatus, SnapshotId};
use crate::storage::{Manifest, SnapshotKind, StorageEngine};

/// What to back up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub kind: SnapshotKind,
    pub resource_types: Vec<ResourceType>,
    pub description: Option<String>,
}

impl BackupRequest {
    pub fn full() -> Self {
        Self {
            kind: SnapshotKind::Full,
            resource_types: ResourceType::ALL.to_vec(),
            description: None,
        }
    }

    pub fn incremental() -> Self {
        Self {
            kind: SnapshotKind::Incremental,
            ..Self::full()
        }
    }

    pub fn with_types(mut self, types: &[ResourceType]) -> Self {
        self.resource_types = types.to_vec();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Requested types, deduplicated, in stage order
    fn normalized_types(&self) -> VaultResult<Vec<ResourceType>> {
        let mut types = self.resource_types.clone();
        types.sort();
        types.dedup();
        if types.is_empty() {
            return Err(VaultError::InvalidRequest(
                "backup request names no resource types".into(),
            ));
        }
        Ok(types)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPhase {
    Idle,
    Collecting,
    Serializing,
    Storing,
    Validating,
    Completed,
    Failed,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::Serializing => "serializing",
            Self::Storing => "storing",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    /// Set once the manifest has been persisted and verified
    pub snapshot_id: Option<SnapshotId>,
    pub requested_kind: SnapshotKind,
    pub kind: SnapshotKind,
    /// An incremental was requested but a full backup was taken instead
    pub substituted_full: bool,
    pub base_snapshot_id: Option<SnapshotId>,
    pub parent_snapshot_id: Option<SnapshotId>,
    pub phase: BackupPhase,
    /// Phase in which the run failed
    pub failed_in: Option<BackupPhase>,
    pub failure: Option<String>,
    pub record_counts: BTreeMap<ResourceType, usize>,
    pub tombstone_counts: BTreeMap<ResourceType, usize>,
    /// Types that could not be collected, with the error text
    pub type_errors: BTreeMap<ResourceType, String>,
    pub warnings: Vec<String>,
    pub chunks_written: u64,
    pub dedup_hits: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupReport {
    fn new(kind: SnapshotKind) -> Self {
        Self {
            snapshot_id: None,
            requested_kind: kind,
            kind,
            substituted_full: false,
            base_snapshot_id: None,
            parent_snapshot_id: None,
            phase: BackupPhase::Idle,
            failed_in: None,
            failure: None,
            record_counts: BTreeMap::new(),
            tombstone_counts: BTreeMap::new(),
            type_errors: BTreeMap::new(),
            warnings: Vec::new(),
            chunks_written: 0,
            dedup_hits: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self.phase {
            BackupPhase::Completed if self.type_errors.is_empty() && self.warnings.is_empty() => {
                RunStatus::Succeeded
            }
            BackupPhase::Completed => RunStatus::SucceededWithSkips,
            _ => RunStatus::Failed,
        }
    }

    pub fn total_records(&self) -> usize {
        self.record_counts.values().sum()
    }

    pub fn summary(&self) -> String {
        match (&self.snapshot_id, self.phase) {
            (Some(id), BackupPhase::Completed) => {
                let mut line = format!(
                    "{} backup {} {}: {} record(s), {} deletion(s), {} chunk(s) written, {} deduplicated",
                    self.kind,
                    id,
                    self.status(),
                    self.total_records(),
                    self.tombstone_counts.values().sum::<usize>(),
                    self.chunks_written,
                    self.dedup_hits
                );
                if self.substituted_full {
                    line.push_str(" (no full base, took full backup)");
                }
                if !self.type_errors.is_empty() {
                    let types: Vec<String> = self.type_errors.keys().map(|t| t.to_string()).collect();
                    line.push_str(&format!("; incomplete: {}", types.join(", ")));
                }
                line
            }
            _ => format!(
                "{} backup failed during {}: {}",
                self.kind,
                self.failed_in.unwrap_or(self.phase),
                self.failure.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    fn enter(&mut self, phase: BackupPhase) {
        info!(from = %self.phase, to = %phase, "Backup phase transition");
        self.phase = phase;
    }
}

/// Summary row for listing snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub snapshot_id: SnapshotId,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    pub base_snapshot_id: Option<SnapshotId>,
    pub parent_snapshot_id: Option<SnapshotId>,
    pub description: Option<String>,
    pub records: usize,
    pub size_bytes: u64,
    pub incomplete_types: Vec<ResourceType>,
}

impl From<&Manifest> for SnapshotInfo {
    fn from(manifest: &Manifest) -> Self {
        Self {
            snapshot_id: manifest.snapshot_id,
            kind: manifest.kind,
            created_at: manifest.created_at,
            base_snapshot_id: manifest.base_snapshot_id,
            parent_snapshot_id: manifest.parent_snapshot_id,
            description: manifest.description.clone(),
            records: manifest.total_records(),
            size_bytes: manifest.total_size(),
            incomplete_types: manifest.incomplete_types.keys().copied().collect(),
        }
    }
}

/// How a run will collect: full, or incremental on top of a chain
struct BackupPlan {
    kind: SnapshotKind,
    base: Option<SnapshotId>,
    parent: Option<SnapshotId>,
    windows: Vec<CollectionWindow>,
    baseline: Option<MaterializedSnapshot>,
}

impl BackupPlan {
    fn full(types: &[ResourceType]) -> Self {
        Self {
            kind: SnapshotKind::Full,
            base: None,
            parent: None,
            windows: types.iter().map(|t| CollectionWindow::full(*t)).collect(),
            baseline: None,
        }
    }

    fn is_full_listing(&self, resource_type: ResourceType) -> bool {
        self.windows
            .iter()
            .find(|w| w.resource_type == resource_type)
            .map_or(true, |w| w.since.is_none())
    }
}

/// Creates, lists and validates snapshots
pub struct BackupManager {
    store: Arc<StorageEngine>,
    collector: Collector,
    loader: SnapshotLoader,
}

impl BackupManager {
    pub fn new(store: Arc<StorageEngine>, collector: Collector) -> Self {
        Self {
            loader: SnapshotLoader::new(store.clone()),
            store,
            collector,
        }
    }

    /// Run one backup.
    ///
    /// Returns `Err` only for a malformed request; run failures are reported
    /// with `phase == Failed`.
    pub async fn create_backup(
        &self,
        request: BackupRequest,
        cancel: &CancelToken,
    ) -> VaultResult<BackupReport> {
        let types = request.normalized_types()?;
        let mut report = BackupReport::new(request.kind);
        let stats_before = self.store.stats();

        let result = self.run(&request, &types, &mut report, cancel).await;

        let stats_after = self.store.stats();
        report.chunks_written = stats_after.chunks_written - stats_before.chunks_written;
        report.dedup_hits = stats_after.dedup_hits - stats_before.dedup_hits;
        report.finished_at = Some(Utc::now());

        match result {
            Ok(snapshot_id) => {
                report.snapshot_id = Some(snapshot_id);
                report.enter(BackupPhase::Completed);
                info!("{}", report.summary());
            }
            Err(err) => {
                report.failed_in = Some(report.phase);
                report.failure = Some(err.to_string());
                report.enter(BackupPhase::Failed);
                error!("{}", report.summary());
            }
        }
        Ok(report)
    }

    async fn run(
        &self,
        request: &BackupRequest,
        types: &[ResourceType],
        report: &mut BackupReport,
        cancel: &CancelToken,
    ) -> VaultResult<SnapshotId> {
        report.enter(BackupPhase::Collecting);
        let plan = self.plan(request.kind, types, report, cancel).await?;
        report.kind = plan.kind;
        report.base_snapshot_id = plan.base;
        report.parent_snapshot_id = plan.parent;

        let baseline = plan.baseline.as_ref().map(|b| &b.resources);
        let mut outcome = self.collector.collect(&plan.windows, baseline, cancel).await?;
        for (resource_type, err) in &outcome.errors {
            report.type_errors.insert(*resource_type, err.to_string());
        }
        if outcome.collected.is_empty() {
            return Err(VaultError::Directory(
                "no resource type could be collected".into(),
            ));
        }
        self.exclude_dangling_assignments(&plan, &mut outcome, report);

        report.enter(BackupPhase::Serializing);
        let snapshot_id = SnapshotId::new();
        let mut manifest = Manifest::new(snapshot_id, plan.kind, report.started_at);
        manifest.base_snapshot_id = plan.base;
        manifest.parent_snapshot_id = plan.parent;
        manifest.description = request.description.clone();

        let mut payloads = Vec::new();
        for resource_type in types {
            if !outcome.succeeded(*resource_type) {
                continue;
            }
            let payload = TypePayload::from_set(
                &outcome.resources,
                *resource_type,
                plan.is_full_listing(*resource_type),
            );
            manifest
                .record_counts
                .insert(*resource_type, payload.records.len());
            manifest
                .tombstone_counts
                .insert(*resource_type, payload.tombstones.len());
            payloads.push((*resource_type, payload.encode()?));
        }
        for (resource_type, err) in &outcome.errors {
            manifest
                .incomplete_types
                .insert(*resource_type, err.to_string());
        }
        report.record_counts = manifest.record_counts.clone();
        report.tombstone_counts = manifest.tombstone_counts.clone();

        report.enter(BackupPhase::Storing);
        for (resource_type, bytes) in payloads {
            let stored = self.store.write(&bytes, cancel).await?;
            manifest.resources.insert(resource_type, stored.chunks);
            manifest
                .payload_hashes
                .insert(resource_type, stored.content_hash);
        }

        report.enter(BackupPhase::Validating);
        self.verify_chunks(&manifest, cancel).await?;
        cancel.check()?;
        manifest.seal();

        // A failed or cancelled write may still have landed
        let written = self.store.put_manifest(&manifest, cancel).await;
        if let Err(e) = written.and_then(|()| cancel.check()) {
            self.discard_manifest(&snapshot_id).await;
            return Err(e);
        }

        let settled = CancelToken::new();
        let verified = match self.store.get_manifest(&snapshot_id, &settled).await {
            Ok(stored) => stored.verify_checksum() && stored == manifest,
            Err(_) => false,
        };
        if !verified {
            self.discard_manifest(&snapshot_id).await;
            return Err(VaultError::corruption(
                format!("manifest {}", snapshot_id),
                "stored manifest did not verify after write",
            ));
        }

        Ok(snapshot_id)
    }

    async fn discard_manifest(&self, snapshot_id: &SnapshotId) {
        if let Err(e) = self.store.delete_manifest(snapshot_id, &CancelToken::new()).await {
            warn!("Failed to remove manifest {}: {}", snapshot_id, e);
        }
    }

    /// Decide between a full run and an incremental on the latest chain
    async fn plan(
        &self,
        kind: SnapshotKind,
        types: &[ResourceType],
        report: &mut BackupReport,
        cancel: &CancelToken,
    ) -> VaultResult<BackupPlan> {
        if kind == SnapshotKind::Full {
            return Ok(BackupPlan::full(types));
        }

        let manifests = self.store.list_manifests(cancel).await?;
        let Some(base) = manifests.iter().find(|m| m.kind == SnapshotKind::Full) else {
            warn!("No full snapshot to base an incremental on, taking a full backup");
            report.substituted_full = true;
            return Ok(BackupPlan::full(types));
        };

        // Newest first, so the head is the parent
        let chain: Vec<&Manifest> = manifests
            .iter()
            .filter(|m| {
                m.snapshot_id == base.snapshot_id || m.base_snapshot_id == Some(base.snapshot_id)
            })
            .collect();
        let parent = chain[0].snapshot_id;

        let windows: Vec<CollectionWindow> = types
            .iter()
            .map(|t| CollectionWindow {
                resource_type: *t,
                since: chain
                    .iter()
                    .find(|m| m.is_complete_for(*t))
                    .map(|m| m.created_at),
            })
            .collect();
        if windows.iter().all(|w| w.since.is_none()) {
            warn!(
                base = %base.snapshot_id,
                "Base chain holds none of the requested types, taking a full backup"
            );
            report.substituted_full = true;
            return Ok(BackupPlan::full(types));
        }

        let baseline = self.loader.load(&parent, cancel).await?;
        info!(base = %base.snapshot_id, parent = %parent, "Incremental backup");
        Ok(BackupPlan {
            kind: SnapshotKind::Incremental,
            base: Some(base.snapshot_id),
            parent: Some(parent),
            windows,
            baseline: Some(baseline),
        })
    }

    /// Drop assignments whose principal or permission set cannot exist in
    /// the resulting snapshot. Only possible to judge when all three
    /// referenced types are complete.
    fn exclude_dangling_assignments(
        &self,
        plan: &BackupPlan,
        outcome: &mut CollectionOutcome,
        report: &mut BackupReport,
    ) {
        let referents = ResourceType::Assignment.dependencies();
        if !outcome.succeeded(ResourceType::Assignment) {
            return;
        }
        let complete = referents.iter().all(|t| {
            outcome.succeeded(*t)
                && (plan.is_full_listing(*t)
                    || plan
                        .baseline
                        .as_ref()
                        .map_or(false, |b| b.available_types.contains(t)))
        });
        if !complete {
            return;
        }

        let mut state: ResourceSet = plan
            .baseline
            .as_ref()
            .map(|b| b.resources.clone())
            .unwrap_or_default();
        for resource_type in referents {
            TypePayload::from_set(
                &outcome.resources,
                *resource_type,
                plan.is_full_listing(*resource_type),
            )
            .apply_to(&mut state);
        }

        let dangling: Vec<_> = outcome
            .resources
            .records(ResourceType::Assignment)
            .filter_map(|record| {
                record
                    .references()
                    .into_iter()
                    .find(|reference| !state.contains(reference))
                    .map(|missing| (record.key(), missing))
            })
            .collect();

        for (key, missing) in dangling {
            outcome.resources.remove_record(&key);
            let warning = format!("Excluded assignment {}: {} not found", key.id, missing);
            warn!("{}", warning);
            report.warnings.push(warning);
        }
    }

    async fn verify_chunks(&self, manifest: &Manifest, cancel: &CancelToken) -> VaultResult<()> {
        let unique: HashSet<_> = manifest.chunk_hashes().copied().collect();
        let workers = self.store.options().workers.max(1);
        stream::iter(unique)
            .map(|hash| async move { self.store.read_chunk(&hash, cancel).await.map(|_| ()) })
            .buffer_unordered(workers)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    pub async fn validate_backup(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<ValidationReport> {
        validate_snapshot(&self.store, snapshot_id, cancel).await
    }

    /// Materialize a snapshot's full state
    pub async fn load_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<MaterializedSnapshot> {
        self.loader.load(snapshot_id, cancel).await
    }

    pub async fn get_manifest(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<Manifest> {
        self.store.get_manifest(snapshot_id, cancel).await
    }

    /// Newest first
    pub async fn list_snapshots(&self, cancel: &CancelToken) -> VaultResult<Vec<SnapshotInfo>> {
        Ok(self
            .store
            .list_manifests(cancel)
            .await?
            .iter()
            .map(SnapshotInfo::from)
            .collect())
    }

    pub async fn latest_full(&self, cancel: &CancelToken) -> VaultResult<Option<SnapshotInfo>> {
        Ok(self
            .list_snapshots(cancel)
            .await?
            .into_iter()
            .find(|s| s.kind == SnapshotKind::Full))
    }
}
