//! Restore execution
//!
//! `preview_restore` loads a snapshot, applies the account mapping, reads
//! the target and returns the plan. `restore` runs that plan stage by
//! stage: stages never overlap, actions inside a stage run concurrently up
//! to the worker limit, and one failed action only takes down the actions
//! that depend on it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::mapping::AccountMapping;
use super::merge::{merge_records, MergeOutcome};
use super::plan::{
    build_plan, stage_of, ActionKind, ConflictEntry, ConflictStrategy, PlannedAction,
    Resolution, RestorePlan, TargetLookups,
};
use crate::audit::{AuditEntry, AuditLogger};
use crate::backup::SnapshotLoader;
use crate::cancel::CancelToken;
use crate::directory::{DirectoryAction, DirectorySource};
use crate::error::{VaultError, VaultResult};
use crate::models::{ResourceKey, ResourceType, RestoreRunId, RunStatus, SnapshotId};
use crate::retry::{retry, RetryPolicy};
use crate::storage::StorageEngine;

/// Caller hook for the `prompt-caller` strategy
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &ConflictEntry) -> Resolution;
}

#[derive(Clone, Default)]
pub struct RestoreOptions {
    /// Types to restore; empty means all
    pub resource_types: Vec<ResourceType>,
    pub strategy: ConflictStrategy,
    pub mapping: Option<AccountMapping>,
    pub dry_run: bool,
    pub resolver: Option<Arc<dyn ConflictResolver>>,
}

impl fmt::Debug for RestoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreOptions")
            .field("resource_types", &self.resource_types)
            .field("strategy", &self.strategy)
            .field("mapping", &self.mapping)
            .field("dry_run", &self.dry_run)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl RestoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = ResourceType>) -> Self {
        self.resource_types = types.into_iter().collect();
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_mapping(mut self, mapping: AccountMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    fn selected_types(&self) -> Vec<ResourceType> {
        if self.resource_types.is_empty() {
            return ResourceType::ALL.to_vec();
        }
        let wanted: BTreeSet<ResourceType> = self.resource_types.iter().copied().collect();
        wanted.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Target already matches the snapshot
    Identical,
    /// Conflict left as it is at the target
    Conflict,
    /// Merge found nothing the target lacks
    NothingToMerge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Created,
    Updated,
    Merged,
    Deleted,
    Skipped { reason: SkipReason },
    Deferred { reason: String },
    Failed { error: String },
    SkippedDependencyFailure { dependency: String },
    Cancelled,
}

impl ActionOutcome {
    /// Whether dependents of this identity must not run
    fn poisons_dependents(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. } | Self::SkippedDependencyFailure { .. } | Self::Cancelled
        )
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Merged => write!(f, "merged"),
            Self::Deleted => write!(f, "deleted"),
            Self::Skipped { reason } => write!(f, "skipped ({:?})", reason),
            Self::Deferred { reason } => write!(f, "deferred to operator: {}", reason),
            Self::Failed { error } => write!(f, "failed: {}", error),
            Self::SkippedDependencyFailure { dependency } => {
                write!(f, "skipped, dependency {} failed", dependency)
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub key: ResourceKey,
    pub action: ActionKind,
    /// Set for conflicting updates
    pub resolution: Option<Resolution>,
    pub outcome: ActionOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub run_id: RestoreRunId,
    pub snapshot_id: SnapshotId,
    pub dry_run: bool,
    /// In execution stage order
    pub actions: Vec<ActionReport>,
    pub warnings: Vec<String>,
}

impl RestoreResult {
    fn count(&self, predicate: impl Fn(&ActionOutcome) -> bool) -> usize {
        self.actions.iter().filter(|a| predicate(&a.outcome)).count()
    }

    pub fn created(&self) -> usize {
        self.count(|o| *o == ActionOutcome::Created)
    }

    pub fn updated(&self) -> usize {
        self.count(|o| *o == ActionOutcome::Updated)
    }

    pub fn merged(&self) -> usize {
        self.count(|o| *o == ActionOutcome::Merged)
    }

    pub fn deleted(&self) -> usize {
        self.count(|o| *o == ActionOutcome::Deleted)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::Skipped { .. }))
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::Deferred { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::Failed { .. }))
    }

    pub fn dependency_skipped(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::SkippedDependencyFailure { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| *o == ActionOutcome::Cancelled)
    }

    /// Actions that met a conflicting target state
    pub fn conflicts(&self) -> usize {
        self.actions.iter().filter(|a| a.resolution.is_some()).count()
    }

    pub fn outcome_of(&self, key: &ResourceKey) -> Option<&ActionOutcome> {
        self.actions
            .iter()
            .find(|a| &a.key == key)
            .map(|a| &a.outcome)
    }

    /// Cancelled actions that would have changed the target
    pub fn unapplied(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.outcome == ActionOutcome::Cancelled && a.action != ActionKind::Skip)
            .count()
    }

    /// `Failed` when anything failed or planned changes were left unapplied
    pub fn status(&self) -> RunStatus {
        if self.failed() > 0 || self.dependency_skipped() > 0 || self.unapplied() > 0 {
            return RunStatus::Failed;
        }
        let degraded = self.deferred() > 0
            || self.cancelled() > 0
            || self.count(|o| {
                *o == ActionOutcome::Skipped {
                    reason: SkipReason::Conflict,
                }
            }) > 0;
        if degraded {
            RunStatus::SucceededWithSkips
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Restore {} from {}{}: {}; {} created, {} updated, {} merged, {} deleted, {} skipped, {} deferred, {} failed, {} dependency-skipped, {} cancelled ({} conflicts)",
            self.run_id,
            self.snapshot_id,
            if self.dry_run { " (dry run)" } else { "" },
            self.status(),
            self.created(),
            self.updated(),
            self.merged(),
            self.deleted(),
            self.skipped(),
            self.deferred(),
            self.failed(),
            self.dependency_skipped(),
            self.cancelled(),
            self.conflicts()
        )
    }
}

#[derive(Default)]
struct ExecutionState {
    reports: Vec<ActionReport>,
    failed: HashSet<ResourceKey>,
    audit: Vec<AuditEntry>,
}

impl ExecutionState {
    fn record(&mut self, report: ActionReport) {
        if report.outcome.poisons_dependents() {
            self.failed.insert(report.key.clone());
        }
        self.reports.push(report);
    }
}

/// Everything a spawned action needs, shared by every task of one run
struct RunContext {
    run_id: RestoreRunId,
    snapshot_id: SnapshotId,
    directory: Arc<dyn DirectorySource>,
    retry: RetryPolicy,
    cancel: CancelToken,
    dry_run: bool,
    resolver: Option<Arc<dyn ConflictResolver>>,
    state: Mutex<ExecutionState>,
}

pub struct RestoreManager {
    loader: SnapshotLoader,
    directory: Arc<dyn DirectorySource>,
    workers: usize,
    retry: RetryPolicy,
    audit: Option<Arc<AuditLogger>>,
}

impl RestoreManager {
    pub fn new(
        store: Arc<StorageEngine>,
        directory: Arc<dyn DirectorySource>,
        workers: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            loader: SnapshotLoader::new(store),
            directory,
            workers: workers.max(1),
            retry,
            audit: None,
        }
    }

    pub fn with_audit(mut self, logger: Arc<AuditLogger>) -> Self {
        self.audit = Some(logger);
        self
    }

    /// Build the plan a restore would execute, touching nothing
    pub async fn preview_restore(
        &self,
        snapshot_id: &SnapshotId,
        options: &RestoreOptions,
        cancel: &CancelToken,
    ) -> VaultResult<RestorePlan> {
        let snapshot = self.loader.load(snapshot_id, cancel).await?;
        let types = options.selected_types();

        let mut warnings = Vec::new();
        for resource_type in &types {
            match (
                snapshot.available_types.contains(resource_type),
                snapshot.incomplete_types.get(resource_type),
            ) {
                (false, _) => warnings.push(format!(
                    "snapshot {} holds no complete {} data; nothing of that type is restored",
                    snapshot_id, resource_type
                )),
                (true, Some(error)) => warnings.push(format!(
                    "{} collection failed in snapshot {} ({}); restoring the last complete state of its chain",
                    resource_type, snapshot_id, error
                )),
                (true, None) => {}
            }
        }

        let mut resources = snapshot.resources;
        resources.retain_types(&types);
        if let Some(mapping) = &options.mapping {
            resources = mapping.apply(&resources)?;
        }

        let mut keys: BTreeSet<ResourceKey> = resources.all_records().map(|r| r.key()).collect();
        keys.extend(resources.all_tombstones().map(|t| t.key()));
        let references: Vec<ResourceKey> = resources
            .all_records()
            .flat_map(|r| r.references())
            .filter(|k| !resources.contains(k))
            .collect();
        keys.extend(references);

        let directory = &self.directory;
        let policy = &self.retry;
        let results: Vec<_> = stream::iter(keys)
            .map(|key| async move {
                let current = retry(policy, "read target state", cancel, || {
                    directory.get_current(key.resource_type, &key.id)
                })
                .await;
                (key, current)
            })
            .buffered(self.workers)
            .collect()
            .await;

        let mut lookups = TargetLookups::new();
        for (key, current) in results {
            if matches!(current, Err(VaultError::Cancelled)) {
                return Err(VaultError::Cancelled);
            }
            if let Err(e) = &current {
                warn!(resource = %key, "Could not read target state: {}", e);
            }
            lookups.insert(key, current);
        }

        let plan = build_plan(*snapshot_id, &resources, &lookups, options.strategy, warnings);
        info!("{}", plan.summary());
        Ok(plan)
    }

    /// Plan and execute a restore.
    ///
    /// `Err` only when the plan cannot be built; action failures are
    /// reported per action in the result.
    pub async fn restore(
        &self,
        snapshot_id: &SnapshotId,
        options: &RestoreOptions,
        cancel: &CancelToken,
    ) -> VaultResult<RestoreResult> {
        let plan = self.preview_restore(snapshot_id, options, cancel).await?;
        Ok(self.execute(plan, options, cancel).await)
    }

    /// Execute a previously built plan
    pub async fn execute(
        &self,
        plan: RestorePlan,
        options: &RestoreOptions,
        cancel: &CancelToken,
    ) -> RestoreResult {
        let run_id = RestoreRunId::new();
        info!(
            run = %run_id,
            snapshot = %plan.snapshot_id,
            dry_run = options.dry_run,
            "Starting restore of {} action(s)",
            plan.actions.len()
        );

        let context = Arc::new(RunContext {
            run_id,
            snapshot_id: plan.snapshot_id,
            directory: Arc::clone(&self.directory),
            retry: self.retry.clone(),
            cancel: cancel.clone(),
            dry_run: options.dry_run,
            resolver: options.resolver.clone(),
            state: Mutex::new(ExecutionState::default()),
        });
        let mut warnings = plan.warnings.clone();

        let mut stages: BTreeMap<u8, Vec<PlannedAction>> = BTreeMap::new();
        for action in plan.actions {
            stages.entry(action.stage()).or_default().push(action);
        }

        for (stage, actions) in stages {
            debug!(run = %run_id, stage, "Executing stage of {} action(s)", actions.len());
            let expected: Vec<(ResourceKey, ActionKind)> =
                actions.iter().map(|a| (a.key.clone(), a.action)).collect();

            let semaphore = Arc::new(Semaphore::new(self.workers));
            let mut tasks = JoinSet::new();
            for action in actions {
                let context = Arc::clone(&context);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let report = match semaphore.acquire_owned().await {
                        Ok(_permit) if !context.cancel.is_cancelled() => {
                            run_action(&context, action).await
                        }
                        _ => ActionReport {
                            key: action.key,
                            action: action.action,
                            resolution: None,
                            outcome: ActionOutcome::Cancelled,
                        },
                    };
                    context.state.lock().record(report);
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(run = %run_id, "Restore task aborted: {}", e);
                }
            }

            let entries = {
                let mut state = context.state.lock();
                let reported: HashSet<ResourceKey> = state
                    .reports
                    .iter()
                    .filter(|r| stage_of(r.key.resource_type, r.action) == stage)
                    .map(|r| r.key.clone())
                    .collect();
                for (key, action) in expected {
                    if !reported.contains(&key) {
                        state.record(ActionReport {
                            key,
                            action,
                            resolution: None,
                            outcome: ActionOutcome::Failed {
                                error: "action task did not complete".into(),
                            },
                        });
                    }
                }
                std::mem::take(&mut state.audit)
            };

            if let (Some(logger), false) = (&self.audit, options.dry_run) {
                if !entries.is_empty() {
                    if let Err(e) = logger.log_batch(&entries) {
                        warn!(run = %run_id, "Failed to write audit entries: {}", e);
                        warnings.push(format!("audit log write failed: {}", e));
                    }
                }
            }
        }

        let mut reports = std::mem::take(&mut context.state.lock().reports);
        reports.sort_by(|a, b| {
            stage_of(a.key.resource_type, a.action)
                .cmp(&stage_of(b.key.resource_type, b.action))
                .then_with(|| a.key.id.cmp(&b.key.id))
        });

        let result = RestoreResult {
            run_id,
            snapshot_id: plan.snapshot_id,
            dry_run: options.dry_run,
            actions: reports,
            warnings,
        };
        match result.status() {
            RunStatus::Failed => warn!("{}", result.summary()),
            _ => info!("{}", result.summary()),
        }
        result
    }
}

async fn run_action(context: &RunContext, action: PlannedAction) -> ActionReport {
    let failed_dependency = {
        let state = context.state.lock();
        action
            .dependencies()
            .into_iter()
            .find(|dependency| state.failed.contains(dependency))
    };

    let mut report = ActionReport {
        key: action.key.clone(),
        action: action.action,
        resolution: None,
        outcome: ActionOutcome::Cancelled,
    };

    if let Some(dependency) = failed_dependency {
        warn!(resource = %action.key, "Skipping, dependency {} failed", dependency);
        report.outcome = ActionOutcome::SkippedDependencyFailure {
            dependency: dependency.to_string(),
        };
        return report;
    }
    if let Some(blocked) = &action.blocked_by {
        error!(resource = %action.key, "Cannot {}: {}", action.action, blocked);
        report.outcome = ActionOutcome::Failed {
            error: blocked.to_string(),
        };
        return report;
    }

    report.outcome = match (action.action, &action.incoming, &action.existing) {
        (ActionKind::Skip, _, _) => ActionOutcome::Skipped {
            reason: SkipReason::Identical,
        },
        (ActionKind::Create, Some(incoming), _) => {
            let audit = AuditEntry::create(context.run_id, context.snapshot_id, incoming);
            apply(context, DirectoryAction::Create(incoming.clone()), ActionOutcome::Created, audit)
                .await
        }
        (ActionKind::Delete, _, existing) => {
            let audit = AuditEntry::delete(
                context.run_id,
                context.snapshot_id,
                action.key.clone(),
                existing.as_ref(),
            );
            apply(context, DirectoryAction::Delete(action.key.clone()), ActionOutcome::Deleted, audit)
                .await
        }
        (ActionKind::Update, Some(incoming), Some(existing)) => {
            let resolution = match &action.conflict {
                Some(conflict) => resolve(context, conflict).await,
                None => Resolution::Overwrite,
            };
            report.resolution = action.conflict.as_ref().map(|_| resolution);
            match resolution {
                Resolution::Overwrite => {
                    let audit =
                        AuditEntry::update(context.run_id, context.snapshot_id, existing, incoming);
                    apply(
                        context,
                        DirectoryAction::Update(incoming.clone()),
                        ActionOutcome::Updated,
                        audit,
                    )
                    .await
                }
                Resolution::Skip => ActionOutcome::Skipped {
                    reason: SkipReason::Conflict,
                },
                Resolution::Merge => match merge_records(existing, incoming) {
                    MergeOutcome::Merged(merged) => {
                        let audit =
                            AuditEntry::update(context.run_id, context.snapshot_id, existing, &merged);
                        apply(context, DirectoryAction::Update(merged), ActionOutcome::Merged, audit)
                            .await
                    }
                    MergeOutcome::Unchanged => ActionOutcome::Skipped {
                        reason: SkipReason::NothingToMerge,
                    },
                    MergeOutcome::Ambiguous(reason) => {
                        let unresolved = VaultError::ConflictUnresolved {
                            resource: action.key.to_string(),
                            reason,
                        };
                        warn!(resource = %action.key, "{}", unresolved);
                        ActionOutcome::Deferred {
                            reason: unresolved.to_string(),
                        }
                    }
                },
                Resolution::DeferredToOperator => ActionOutcome::Deferred {
                    reason: "conflict deferred to operator".into(),
                },
            }
        }
        (kind, _, _) => ActionOutcome::Failed {
            error: format!("{} action for {} is missing its record state", kind, action.key),
        },
    };
    report
}

async fn resolve(context: &RunContext, conflict: &ConflictEntry) -> Resolution {
    match conflict.strategy {
        ConflictStrategy::Overwrite => Resolution::Overwrite,
        ConflictStrategy::Skip => Resolution::Skip,
        ConflictStrategy::Merge => Resolution::Merge,
        ConflictStrategy::PromptCaller => match (&context.resolver, context.dry_run) {
            (Some(resolver), false) => resolver.resolve(conflict).await,
            _ => Resolution::DeferredToOperator,
        },
    }
}

async fn apply(
    context: &RunContext,
    change: DirectoryAction,
    success: ActionOutcome,
    audit: AuditEntry,
) -> ActionOutcome {
    let key = change.key();
    if context.dry_run {
        debug!(resource = %key, "Dry run, would {}", change.verb());
        return success;
    }

    let directory = &context.directory;
    let change = &change;
    match retry(&context.retry, change.verb(), &context.cancel, || {
        directory.apply(change)
    })
    .await
    {
        Ok(()) => {
            debug!(resource = %key, "Applied {}", change.verb());
            context.state.lock().audit.push(audit);
            success
        }
        Err(VaultError::Cancelled) => ActionOutcome::Cancelled,
        Err(e) => {
            error!(resource = %key, "Failed to {}: {}", change.verb(), e);
            ActionOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupManager, BackupRequest};
    use crate::collector::Collector;
    use crate::directory::InMemoryDirectory;
    use crate::models::{Assignment, Group, PermissionSet, PrincipalKind, ResourceRecord, User};
    use crate::storage::{
        ChunkStoreOptions, InMemoryObjectClient, ObjectStorageBackend, StorageBackend,
    };
    use tempfile::TempDir;

    fn sample_records() -> Vec<ResourceRecord> {
        vec![
            User::new("u-1", "alice", "Alice").into(),
            User::new("u-2", "bob", "Bob").into(),
            Group::new("g-1", "Admins").with_members(["u-1"]).into(),
            PermissionSet::new("ps-1", "Admin").into(),
            Assignment::new(PrincipalKind::Group, "g-1", "ps-1", "111111111111").into(),
            Assignment::new(PrincipalKind::User, "u-2", "ps-1", "111111111111").into(),
        ]
    }

    fn create_test_store() -> Arc<StorageEngine> {
        let backend: Arc<dyn StorageBackend> = Arc::new(ObjectStorageBackend::new(
            Arc::new(InMemoryObjectClient::with_buckets(["vault"])),
            "vault",
            "restore",
        ));
        let options = ChunkStoreOptions {
            chunk_size: 64,
            ..ChunkStoreOptions::default()
        };
        Arc::new(StorageEngine::new(backend, options, None, RetryPolicy::immediate(3)).unwrap())
    }

    async fn backed_up_snapshot(store: &Arc<StorageEngine>) -> SnapshotId {
        let source = Arc::new(InMemoryDirectory::with_records(sample_records()));
        let collector = Collector::new(source, 4, RetryPolicy::immediate(3));
        let manager = BackupManager::new(Arc::clone(store), collector);
        let report = manager
            .create_backup(BackupRequest::full(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.status(), RunStatus::Succeeded, "{}", report.summary());
        report.snapshot_id.unwrap()
    }

    fn restore_manager(store: &Arc<StorageEngine>, target: &Arc<InMemoryDirectory>) -> RestoreManager {
        RestoreManager::new(
            Arc::clone(store),
            Arc::clone(target) as Arc<dyn DirectorySource>,
            4,
            RetryPolicy::immediate(2),
        )
    }

    #[tokio::test]
    async fn test_restore_into_empty_directory_creates_everything() {
        let store = create_test_store();
        let snapshot = backed_up_snapshot(&store).await;
        let target = Arc::new(InMemoryDirectory::new());

        let result = restore_manager(&store, &target)
            .restore(&snapshot, &RestoreOptions::new(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.created(), 6);
        assert_eq!(result.status(), RunStatus::Succeeded);
        assert_eq!(target.len(), 6);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_target_untouched() {
        let store = create_test_store();
        let snapshot = backed_up_snapshot(&store).await;
        let target = Arc::new(InMemoryDirectory::new());

        let result = restore_manager(&store, &target)
            .restore(&snapshot, &RestoreOptions::new().dry_run(), &CancelToken::new())
            .await
            .unwrap();

        assert!(result.dry_run);
        assert_eq!(result.created(), 6);
        assert!(target.is_empty());
        assert_eq!(target.apply_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_principal_skips_dependent_assignment() {
        let store = create_test_store();
        let snapshot = backed_up_snapshot(&store).await;
        let target = Arc::new(InMemoryDirectory::new());
        target.fail_apply(
            ResourceKey::new(ResourceType::User, "u-2"),
            10,
            VaultError::Directory("quota exceeded".into()),
        );

        let result = restore_manager(&store, &target)
            .restore(&snapshot, &RestoreOptions::new(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.failed(), 1);
        assert_eq!(result.dependency_skipped(), 1);
        assert_eq!(
            result.outcome_of(&ResourceKey::new(
                ResourceType::Assignment,
                "111111111111:ps-1:user:u-2"
            )),
            Some(&ActionOutcome::SkippedDependencyFailure {
                dependency: "user/u-2".into()
            })
        );
        // Unrelated actions still went through
        assert_eq!(result.created(), 4);
        assert_eq!(result.status(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_conflict_strategies() {
        let store = create_test_store();
        let snapshot = backed_up_snapshot(&store).await;

        let drifted = || {
            let target = Arc::new(InMemoryDirectory::with_records(sample_records()));
            target.upsert(User::new("u-1", "alice", "Alice Cooper").into());
            target.upsert(Group::new("g-1", "Admins").with_members(["u-2"]).into());
            target
        };

        // skip leaves both conflicts alone
        let target = drifted();
        let result = restore_manager(&store, &target)
            .restore(&snapshot, &RestoreOptions::new(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result.conflicts(), 2);
        assert_eq!(result.skipped(), 6);
        assert_eq!(result.status(), RunStatus::SucceededWithSkips);

        // overwrite writes the snapshot state back
        let target = drifted();
        let result = restore_manager(&store, &target)
            .restore(
                &snapshot,
                &RestoreOptions::new().with_strategy(ConflictStrategy::Overwrite),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.updated(), 2);
        assert_eq!(result.status(), RunStatus::Succeeded);
        match target.get(&ResourceKey::new(ResourceType::User, "u-1")) {
            Some(ResourceRecord::User(user)) => assert_eq!(user.display_name, "Alice"),
            other => panic!("unexpected record {:?}", other),
        }

        // merge unions the group and defers the user
        let target = drifted();
        let result = restore_manager(&store, &target)
            .restore(
                &snapshot,
                &RestoreOptions::new().with_strategy(ConflictStrategy::Merge),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.merged(), 1);
        assert_eq!(result.deferred(), 1);
        match target.get(&ResourceKey::new(ResourceType::Group, "g-1")) {
            Some(ResourceRecord::Group(group)) => assert_eq!(group.members.len(), 2),
            other => panic!("unexpected record {:?}", other),
        }
    }

    struct AlwaysOverwrite;

    #[async_trait]
    impl ConflictResolver for AlwaysOverwrite {
        async fn resolve(&self, _conflict: &ConflictEntry) -> Resolution {
            Resolution::Overwrite
        }
    }

    #[tokio::test]
    async fn test_prompt_caller_consults_resolver() {
        let store = create_test_store();
        let snapshot = backed_up_snapshot(&store).await;
        let target = Arc::new(InMemoryDirectory::with_records(sample_records()));
        target.upsert(PermissionSet::new("ps-1", "ReadOnly").into());

        let without = restore_manager(&store, &target)
            .restore(
                &snapshot,
                &RestoreOptions::new().with_strategy(ConflictStrategy::PromptCaller),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(without.deferred(), 1);

        let with = restore_manager(&store, &target)
            .restore(
                &snapshot,
                &RestoreOptions::new()
                    .with_strategy(ConflictStrategy::PromptCaller)
                    .with_resolver(Arc::new(AlwaysOverwrite)),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(with.updated(), 1);
        assert_eq!(
            with.actions
                .iter()
                .find_map(|a| a.resolution),
            Some(Resolution::Overwrite)
        );
    }

    #[tokio::test]
    async fn test_cancelled_restore_reports_every_action_cancelled() {
        let store = create_test_store();
        let snapshot = backed_up_snapshot(&store).await;
        let target = Arc::new(InMemoryDirectory::new());
        let manager = restore_manager(&store, &target);

        let plan = manager
            .preview_restore(&snapshot, &RestoreOptions::new(), &CancelToken::new())
            .await
            .unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = manager.execute(plan, &RestoreOptions::new(), &cancel).await;

        assert_eq!(result.cancelled(), 6);
        assert_eq!(result.unapplied(), 6);
        assert!(target.is_empty());
        assert_eq!(result.status(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_skips_leave_nothing_unapplied() {
        let store = create_test_store();
        let snapshot = backed_up_snapshot(&store).await;
        let target = Arc::new(InMemoryDirectory::with_records(sample_records()));
        let manager = restore_manager(&store, &target);

        let plan = manager
            .preview_restore(&snapshot, &RestoreOptions::new(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(plan.count(ActionKind::Skip), 6);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = manager.execute(plan, &RestoreOptions::new(), &cancel).await;

        assert_eq!(result.cancelled(), 6);
        assert_eq!(result.unapplied(), 0);
        assert_eq!(result.status(), RunStatus::SucceededWithSkips);
    }

    #[tokio::test]
    async fn test_applied_actions_are_audited() {
        let store = create_test_store();
        let snapshot = backed_up_snapshot(&store).await;
        let target = Arc::new(InMemoryDirectory::new());
        let temp_dir = TempDir::new().unwrap();
        let logger = Arc::new(AuditLogger::new(temp_dir.path().join("audit.jsonl")));

        let result = restore_manager(&store, &target)
            .with_audit(Arc::clone(&logger))
            .restore(&snapshot, &RestoreOptions::new(), &CancelToken::new())
            .await
            .unwrap();

        let entries = logger.read_run(&result.run_id).unwrap();
        assert_eq!(entries.len(), 6);
        assert!(entries.iter().all(|e| e.snapshot_id == snapshot));
    }

    #[tokio::test]
    async fn test_incomplete_mapping_fails_preview() {
        let store = create_test_store();
        let snapshot = backed_up_snapshot(&store).await;
        let target = Arc::new(InMemoryDirectory::new());
        let mapping = AccountMapping::new().map_principal("u-1", "u-9");

        let err = restore_manager(&store, &target)
            .preview_restore(
                &snapshot,
                &RestoreOptions::new().with_mapping(mapping),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::MappingIncomplete { .. }));
        assert_eq!(target.get_calls(), 0);
    }
}
