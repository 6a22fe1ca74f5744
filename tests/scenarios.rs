//! End-to-end scenarios through the `Vault` facade

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use idvault::audit::Operation;
use idvault::config::settings::BackendSettings;
use idvault::config::{Settings, VaultPaths};
use idvault::directory::InMemoryDirectory;
use idvault::models::{
    Assignment, Group, PermissionSet, PrincipalKind, ResourceKey, ResourceRecord, ResourceType,
    RunStatus, User,
};
use idvault::restore::{ActionKind, ActionOutcome};
use idvault::retention::RetentionRule;
use idvault::storage::InMemoryObjectClient;
use idvault::{
    AccountMapping, BackupRequest, CancelToken, ConflictStrategy, RestoreOptions,
    RetentionPolicy, Vault, VaultError,
};
use tempfile::TempDir;

const PERMISSION_SET: &str = "arn:aws:sso:::permissionSet/ssoins-1/ps-admin";

fn test_paths() -> (VaultPaths, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let paths = VaultPaths::with_base_dir(temp_dir.path().to_path_buf());
    paths.ensure_directories().unwrap();
    (paths, temp_dir)
}

/// Three users, one group, one permission set and two assignments
fn sample_records() -> Vec<ResourceRecord> {
    vec![
        User::new("u-1", "alice", "Alice").into(),
        User::new("u-2", "bob", "Bob").into(),
        User::new("u-3", "carol", "Carol").into(),
        Group::new("g-1", "Admins").with_members(["u-1", "u-2"]).into(),
        PermissionSet::new(PERMISSION_SET, "AdministratorAccess").into(),
        Assignment::new(PrincipalKind::User, "u-3", PERMISSION_SET, "111111111111").into(),
        Assignment::new(PrincipalKind::Group, "g-1", PERMISSION_SET, "111111111111").into(),
    ]
}

async fn vault_for(
    paths: &VaultPaths,
    settings: &Settings,
    directory: Arc<InMemoryDirectory>,
) -> Vault {
    Vault::builder(paths.clone(), settings.clone())
        .directory(directory)
        .build()
        .await
        .unwrap()
}

fn by_key<'a>(records: impl Iterator<Item = &'a ResourceRecord>) -> BTreeMap<ResourceKey, ResourceRecord> {
    records.map(|r| (r.key(), r.clone())).collect()
}

#[tokio::test]
async fn test_backup_then_restore_into_empty_directory() {
    let (paths, _temp_dir) = test_paths();
    let settings = Settings::default();
    let cancel = CancelToken::new();

    let source = Arc::new(InMemoryDirectory::with_records(sample_records()));
    let snapshot = vault_for(&paths, &settings, source.clone())
        .await
        .create_backup(BackupRequest::full(), &cancel)
        .await
        .unwrap()
        .snapshot_id
        .unwrap();

    let target = Arc::new(InMemoryDirectory::new());
    let vault = vault_for(&paths, &settings, target.clone()).await;
    let options = RestoreOptions::new().with_strategy(ConflictStrategy::Overwrite);

    let first = vault.restore(&snapshot, &options, &cancel).await.unwrap();
    assert_eq!(first.status(), RunStatus::Succeeded);
    assert_eq!(first.created(), 7);
    assert_eq!(target.len(), 7);

    let restored = target.snapshot();
    let original = source.snapshot();
    let restored = by_key(restored.iter());
    for (key, record) in by_key(original.iter()) {
        assert!(record.same_state(&restored[&key]), "{} differs after restore", key);
    }

    // Everything already matches, so a second run only skips
    let again = vault
        .restore(
            &snapshot,
            &RestoreOptions::new().with_strategy(ConflictStrategy::Skip),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(again.skipped(), 7);
    assert_eq!(again.conflicts(), 0);
    assert_eq!(again.created(), 0);
    assert_eq!(again.status(), RunStatus::Succeeded);
}

#[tokio::test]
async fn test_plan_orders_actions_by_dependency() {
    let (paths, _temp_dir) = test_paths();
    let settings = Settings::default();
    let cancel = CancelToken::new();

    let source = Arc::new(InMemoryDirectory::with_records(sample_records()));
    let snapshot = vault_for(&paths, &settings, source)
        .await
        .create_backup(BackupRequest::full(), &cancel)
        .await
        .unwrap()
        .snapshot_id
        .unwrap();

    let vault = vault_for(&paths, &settings, Arc::new(InMemoryDirectory::new())).await;
    let plan = vault
        .preview_restore(&snapshot, &RestoreOptions::new(), &cancel)
        .await
        .unwrap();

    assert_eq!(plan.count(ActionKind::Create), 7);
    let stages: Vec<u8> = plan.actions.iter().map(|a| a.stage()).collect();
    let mut sorted = stages.clone();
    sorted.sort();
    assert_eq!(stages, sorted);

    let position = |resource_type: ResourceType| {
        plan.actions
            .iter()
            .position(|a| a.key.resource_type == resource_type)
            .unwrap()
    };
    let last_of = |resource_type: ResourceType| {
        plan.actions
            .iter()
            .rposition(|a| a.key.resource_type == resource_type)
            .unwrap()
    };
    assert!(last_of(ResourceType::User) < position(ResourceType::Group));
    assert!(last_of(ResourceType::Group) < position(ResourceType::Assignment));
    assert!(last_of(ResourceType::PermissionSet) < position(ResourceType::Assignment));
}

#[tokio::test]
async fn test_incremental_materializes_current_state() {
    let (paths, _temp_dir) = test_paths();
    let settings = Settings::default();
    let cancel = CancelToken::new();

    let directory = Arc::new(InMemoryDirectory::with_records(sample_records()));
    let vault = vault_for(&paths, &settings, directory.clone()).await;
    let full = vault
        .create_backup(BackupRequest::full(), &cancel)
        .await
        .unwrap();
    assert_eq!(full.status(), RunStatus::Succeeded);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut dave = User::new("u-4", "dave", "Dave");
    dave.modified_at = Some(chrono::Utc::now());
    directory.upsert(dave.into());
    directory.remove(&ResourceKey::new(ResourceType::User, "u-2"));
    let mut admins = Group::new("g-1", "Admins").with_members(["u-1", "u-4"]);
    admins.modified_at = Some(chrono::Utc::now());
    directory.upsert(admins.into());

    let incremental = vault
        .create_backup(BackupRequest::incremental(), &cancel)
        .await
        .unwrap();
    assert!(!incremental.substituted_full);
    assert_eq!(incremental.base_snapshot_id, full.snapshot_id);
    let snapshot = incremental.snapshot_id.unwrap();

    let loaded = vault.load_snapshot(&snapshot, &cancel).await.unwrap();
    assert_eq!(loaded.chain.len(), 2);

    let live = directory.snapshot();
    let live = by_key(live.iter());
    let materialized = by_key(loaded.resources.all_records());
    assert_eq!(
        materialized.keys().collect::<Vec<_>>(),
        live.keys().collect::<Vec<_>>()
    );
    for (key, record) in &live {
        assert!(record.same_state(&materialized[key]), "{} differs", key);
    }
}

#[tokio::test]
async fn test_incremental_restore_deletes_removed_resources() {
    let (paths, _temp_dir) = test_paths();
    let settings = Settings::default();
    let cancel = CancelToken::new();

    let directory = Arc::new(InMemoryDirectory::with_records(sample_records()));
    let vault = vault_for(&paths, &settings, directory.clone()).await;
    vault
        .create_backup(BackupRequest::full(), &cancel)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let carol = ResourceKey::new(ResourceType::User, "u-3");
    let carol_assignment = ResourceRecord::from(Assignment::new(
        PrincipalKind::User,
        "u-3",
        PERMISSION_SET,
        "111111111111",
    ))
    .key();
    directory.remove(&carol_assignment).unwrap();
    directory.remove(&carol).unwrap();

    let incremental = vault
        .create_backup(BackupRequest::incremental(), &cancel)
        .await
        .unwrap();
    assert!(!incremental.substituted_full);
    let snapshot = incremental.snapshot_id.unwrap();

    // The target still holds everything the full backup saw
    let target = Arc::new(InMemoryDirectory::with_records(sample_records()));
    let vault = vault_for(&paths, &settings, target.clone()).await;
    let result = vault
        .restore(&snapshot, &RestoreOptions::new(), &cancel)
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Succeeded, "{}", result.summary());
    assert_eq!(result.deleted(), 2);
    assert_eq!(result.skipped(), 5);
    assert_eq!(result.outcome_of(&carol), Some(&ActionOutcome::Deleted));
    assert_eq!(result.outcome_of(&carol_assignment), Some(&ActionOutcome::Deleted));
    assert!(target.get(&carol).is_none());
    assert!(target.get(&carol_assignment).is_none());
    assert_eq!(target.len(), 5);

    // The assignment must go before the user it references
    let audit = vault.audit_log().unwrap().read_run(&result.run_id).unwrap();
    let deletes: Vec<(ResourceType, String)> = audit
        .iter()
        .filter(|e| e.operation == Operation::Delete)
        .map(|e| (e.resource_type, e.resource_id.clone()))
        .collect();
    assert_eq!(
        deletes,
        vec![
            (ResourceType::Assignment, carol_assignment.id.clone()),
            (ResourceType::User, "u-3".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_validate_names_the_corrupt_chunk() {
    let (paths, _temp_dir) = test_paths();
    let mut settings = Settings::default();
    settings.storage.backend = BackendSettings::ObjectStorage {
        bucket: "vault".into(),
        prefix: String::new(),
    };
    let client = Arc::new(InMemoryObjectClient::with_buckets(["vault"]));
    let cancel = CancelToken::new();

    let vault = Vault::builder(paths, settings)
        .directory(Arc::new(InMemoryDirectory::with_records(sample_records())))
        .object_client(client.clone())
        .build()
        .await
        .unwrap();
    let snapshot = vault
        .create_backup(BackupRequest::full(), &cancel)
        .await
        .unwrap()
        .snapshot_id
        .unwrap();
    assert!(vault.validate_backup(&snapshot, &cancel).await.unwrap().is_valid());

    let manifest = vault.store().get_manifest(&snapshot, &cancel).await.unwrap();
    let victim = manifest.resources[&ResourceType::Group][0].content_hash;
    client.overwrite("vault", &victim.storage_key(), b"garbage".to_vec());

    let report = vault.validate_backup(&snapshot, &cancel).await.unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(report.corrupt_chunks(), vec![victim]);

    let err = vault.load_snapshot(&snapshot, &cancel).await.unwrap_err();
    assert!(matches!(err, VaultError::Corruption { .. }));
}

#[tokio::test]
async fn test_mapping_must_cover_every_identifier() {
    let (paths, _temp_dir) = test_paths();
    let settings = Settings::default();
    let cancel = CancelToken::new();

    let snapshot = vault_for(
        &paths,
        &settings,
        Arc::new(InMemoryDirectory::with_records(sample_records())),
    )
    .await
    .create_backup(BackupRequest::full(), &cancel)
    .await
    .unwrap()
    .snapshot_id
    .unwrap();

    let target = Arc::new(InMemoryDirectory::new());
    let vault = vault_for(&paths, &settings, target.clone()).await;

    let partial = AccountMapping::new()
        .map_principal("u-1", "t-u-1")
        .map_account("111111111111", "222222222222");
    let err = vault
        .restore(&snapshot, &RestoreOptions::new().with_mapping(partial), &cancel)
        .await
        .unwrap_err();
    match err {
        VaultError::MappingIncomplete { missing } => {
            assert!(missing.contains(&"principal:u-2".to_string()));
            assert!(missing.contains(&format!("permission_set:{}", PERMISSION_SET)));
        }
        other => panic!("expected MappingIncomplete, got {:?}", other),
    }
    assert!(target.is_empty());
    assert_eq!(target.apply_calls(), 0);

    let target_ps = "arn:aws:sso:::permissionSet/ssoins-2/ps-admin";
    let complete = AccountMapping::new()
        .map_principal("u-1", "t-u-1")
        .map_principal("u-2", "t-u-2")
        .map_principal("u-3", "t-u-3")
        .map_principal("g-1", "t-g-1")
        .map_permission_set(PERMISSION_SET, target_ps)
        .map_account("111111111111", "222222222222");
    let result = vault
        .restore(&snapshot, &RestoreOptions::new().with_mapping(complete), &cancel)
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Succeeded);
    assert_eq!(result.created(), 7);
    let assignment = Assignment::new(PrincipalKind::Group, "t-g-1", target_ps, "222222222222");
    assert!(target
        .get(&ResourceKey::new(ResourceType::Assignment, assignment.id()))
        .is_some());
    assert!(target.get(&ResourceKey::new(ResourceType::User, "u-1")).is_none());
    assert!(matches!(
        result.outcome_of(&ResourceKey::new(ResourceType::User, "t-u-1")),
        Some(ActionOutcome::Created)
    ));
}

#[tokio::test]
async fn test_retention_prunes_incrementals_with_their_base() {
    let (paths, _temp_dir) = test_paths();
    let settings = Settings::default();
    let cancel = CancelToken::new();

    let directory = Arc::new(InMemoryDirectory::with_records(sample_records()));
    let vault = vault_for(&paths, &settings, directory.clone()).await;

    let old_full = vault
        .create_backup(BackupRequest::full(), &cancel)
        .await
        .unwrap()
        .snapshot_id
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut erin = User::new("u-5", "erin", "Erin");
    erin.modified_at = Some(chrono::Utc::now());
    directory.upsert(erin.into());
    let incremental = vault
        .create_backup(BackupRequest::incremental(), &cancel)
        .await
        .unwrap()
        .snapshot_id
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let new_full = vault
        .create_backup(BackupRequest::full(), &cancel)
        .await
        .unwrap()
        .snapshot_id
        .unwrap();

    let policy = RetentionPolicy::new(vec![RetentionRule::KeepLast { count: 1 }]);
    let report = vault.enforce_retention(&policy, &cancel).await.unwrap();

    assert_eq!(report.retained, vec![new_full]);
    assert_eq!(report.pruned.len(), 2);
    assert!(report.pruned.contains(&old_full));
    assert!(report.pruned.contains(&incremental));

    let remaining = vault.list_snapshots(&cancel).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(vault.validate_backup(&new_full, &cancel).await.unwrap().is_valid());

    // A second pass finds nothing left to do
    let again = vault.enforce_retention(&policy, &cancel).await.unwrap();
    assert!(again.pruned.is_empty());
    assert_eq!(again.chunks_deleted, 0);
}
