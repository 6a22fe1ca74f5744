//! The `Vault` facade
//!
//! Wires settings, the storage backend, the key provider and the directory
//! source together once, and exposes the operations an embedding
//! application or the `idvault` binary calls.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::audit::AuditLogger;
use crate::backup::{
    validate_snapshot, BackupManager, BackupReport, BackupRequest, MaterializedSnapshot,
    SnapshotInfo, SnapshotLoader, ValidationReport,
};
use crate::cancel::CancelToken;
use crate::collector::Collector;
use crate::config::{Settings, VaultPaths};
use crate::crypto::KeyProvider;
use crate::directory::DirectorySource;
use crate::error::{VaultError, VaultResult};
use crate::models::SnapshotId;
use crate::restore::{RestoreManager, RestoreOptions, RestorePlan, RestoreResult};
use crate::retention::{RetentionManager, RetentionPlan, RetentionPolicy, RetentionReport};
use crate::storage::{chunk_store_options, open_backend, ObjectClient, StorageEngine};

pub struct VaultBuilder {
    paths: VaultPaths,
    settings: Settings,
    directory: Option<Arc<dyn DirectorySource>>,
    keys: Option<Arc<dyn KeyProvider>>,
    object_client: Option<Arc<dyn ObjectClient>>,
}

impl VaultBuilder {
    pub fn new(paths: VaultPaths, settings: Settings) -> Self {
        Self {
            paths,
            settings,
            directory: None,
            keys: None,
            object_client: None,
        }
    }

    /// Directory read during backup and written during restore
    pub fn directory(mut self, directory: Arc<dyn DirectorySource>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Client for the object-storage backend
    pub fn object_client(mut self, client: Arc<dyn ObjectClient>) -> Self {
        self.object_client = Some(client);
        self
    }

    pub async fn build(self) -> VaultResult<Vault> {
        self.settings.validate()?;
        if self.settings.storage.encryption.enabled && self.keys.is_none() {
            return Err(VaultError::ConfigurationInvalid(
                "encryption is enabled but no key provider was supplied".into(),
            ));
        }

        let backend = open_backend(&self.settings, &self.paths, self.object_client).await?;
        info!(backend = backend.name(), "Opened storage backend");
        let store = Arc::new(StorageEngine::new(
            backend,
            chunk_store_options(&self.settings),
            self.keys,
            self.settings.retry_policy(),
        )?);
        let audit = self
            .settings
            .audit_enabled
            .then(|| Arc::new(AuditLogger::new(self.paths.audit_log())));

        Ok(Vault {
            paths: self.paths,
            settings: self.settings,
            store,
            directory: self.directory,
            audit,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub backend: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn summary(&self) -> String {
        match &self.error {
            None => format!("Backend '{}' is reachable", self.backend),
            Some(e) => format!("Backend '{}' is NOT reachable: {}", self.backend, e),
        }
    }
}

pub struct Vault {
    paths: VaultPaths,
    settings: Settings,
    store: Arc<StorageEngine>,
    directory: Option<Arc<dyn DirectorySource>>,
    audit: Option<Arc<AuditLogger>>,
}

impl Vault {
    pub fn builder(paths: VaultPaths, settings: Settings) -> VaultBuilder {
        VaultBuilder::new(paths, settings)
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<StorageEngine> {
        &self.store
    }

    pub fn audit_log(&self) -> Option<&Arc<AuditLogger>> {
        self.audit.as_ref()
    }

    fn directory(&self) -> VaultResult<Arc<dyn DirectorySource>> {
        self.directory.clone().ok_or_else(|| {
            VaultError::ConfigurationInvalid("no directory source configured".into())
        })
    }

    fn restore_manager(&self) -> VaultResult<RestoreManager> {
        let manager = RestoreManager::new(
            Arc::clone(&self.store),
            self.directory()?,
            self.settings.workers,
            self.settings.retry_policy(),
        );
        Ok(match &self.audit {
            Some(logger) => manager.with_audit(Arc::clone(logger)),
            None => manager,
        })
    }

    pub async fn create_backup(
        &self,
        request: BackupRequest,
        cancel: &CancelToken,
    ) -> VaultResult<BackupReport> {
        let collector = Collector::new(
            self.directory()?,
            self.settings.workers,
            self.settings.retry_policy(),
        );
        BackupManager::new(Arc::clone(&self.store), collector)
            .create_backup(request, cancel)
            .await
    }

    pub async fn validate_backup(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<ValidationReport> {
        validate_snapshot(&self.store, snapshot_id, cancel).await
    }

    pub async fn load_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<MaterializedSnapshot> {
        SnapshotLoader::new(Arc::clone(&self.store))
            .load(snapshot_id, cancel)
            .await
    }

    pub async fn preview_restore(
        &self,
        snapshot_id: &SnapshotId,
        options: &RestoreOptions,
        cancel: &CancelToken,
    ) -> VaultResult<RestorePlan> {
        self.restore_manager()?
            .preview_restore(snapshot_id, options, cancel)
            .await
    }

    pub async fn restore(
        &self,
        snapshot_id: &SnapshotId,
        options: &RestoreOptions,
        cancel: &CancelToken,
    ) -> VaultResult<RestoreResult> {
        self.restore_manager()?
            .restore(snapshot_id, options, cancel)
            .await
    }

    pub async fn enforce_retention(
        &self,
        policy: &RetentionPolicy,
        cancel: &CancelToken,
    ) -> VaultResult<RetentionReport> {
        RetentionManager::new(Arc::clone(&self.store))
            .enforce(policy, cancel)
            .await
    }

    pub async fn plan_retention(
        &self,
        policy: &RetentionPolicy,
        cancel: &CancelToken,
    ) -> VaultResult<RetentionPlan> {
        RetentionManager::new(Arc::clone(&self.store))
            .plan(policy, cancel)
            .await
    }

    /// Stored snapshots, newest first
    pub async fn list_snapshots(&self, cancel: &CancelToken) -> VaultResult<Vec<SnapshotInfo>> {
        Ok(self
            .store
            .list_manifests(cancel)
            .await?
            .iter()
            .map(SnapshotInfo::from)
            .collect())
    }

    pub async fn health_check(&self) -> HealthReport {
        let backend = self.store.backend().name().to_string();
        match self.store.health_check().await {
            Ok(()) => HealthReport {
                backend,
                reachable: true,
                error: None,
            },
            Err(e) => {
                warn!(backend = %backend, "Health check failed: {}", e);
                HealthReport {
                    backend,
                    reachable: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Delete chunks left behind by cancelled or failed backups.
    ///
    /// Must not run while a backup is in progress against the same store.
    pub async fn discard_partial_chunks(&self, cancel: &CancelToken) -> VaultResult<usize> {
        self.store.sweep_orphans(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyDerivationParams, SecureString, StaticKeyProvider};
    use crate::directory::InMemoryDirectory;
    use crate::models::{Group, ResourceRecord, RunStatus, User};
    use tempfile::TempDir;

    fn create_test_paths() -> (VaultPaths, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = VaultPaths::with_base_dir(temp_dir.path().to_path_buf());
        paths.ensure_directories().unwrap();
        (paths, temp_dir)
    }

    fn directory() -> Arc<InMemoryDirectory> {
        Arc::new(InMemoryDirectory::with_records([
            ResourceRecord::from(User::new("u-1", "alice", "Alice")),
            Group::new("g-1", "Admins").with_members(["u-1"]).into(),
        ]))
    }

    #[tokio::test]
    async fn test_backup_and_restore_through_facade() {
        let (paths, _temp_dir) = create_test_paths();
        let source = directory();
        let vault = Vault::builder(paths.clone(), Settings::default())
            .directory(source)
            .build()
            .await
            .unwrap();
        let cancel = CancelToken::new();

        let report = vault
            .create_backup(BackupRequest::full(), &cancel)
            .await
            .unwrap();
        let snapshot = report.snapshot_id.unwrap();
        assert!(vault.validate_backup(&snapshot, &cancel).await.unwrap().is_valid());
        assert_eq!(vault.list_snapshots(&cancel).await.unwrap().len(), 1);

        let target = Arc::new(InMemoryDirectory::new());
        let restorer = Vault::builder(paths, Settings::default())
            .directory(target.clone())
            .build()
            .await
            .unwrap();
        let result = restorer
            .restore(&snapshot, &RestoreOptions::new(), &cancel)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Succeeded);
        assert_eq!(target.len(), 2);
        let audited = restorer
            .audit_log()
            .unwrap()
            .read_run(&result.run_id)
            .unwrap();
        assert_eq!(audited.len(), 2);
    }

    #[tokio::test]
    async fn test_encryption_needs_a_key_provider() {
        let (paths, _temp_dir) = create_test_paths();
        let mut settings = Settings::default();
        settings.storage.encryption.enabled = true;

        let err = Vault::builder(paths, settings).build().await.err().unwrap();
        assert!(matches!(err, VaultError::ConfigurationInvalid(_)));
    }

    #[tokio::test]
    async fn test_encrypted_vault_round_trips() {
        let (paths, _temp_dir) = create_test_paths();
        let mut settings = Settings::default();
        settings.storage.encryption.enabled = true;
        let keys = StaticKeyProvider::from_passphrase(
            &SecureString::new("correct horse battery staple"),
            &KeyDerivationParams::insecure_fast(),
        )
        .unwrap();

        let vault = Vault::builder(paths, settings)
            .directory(directory())
            .key_provider(Arc::new(keys))
            .build()
            .await
            .unwrap();
        let cancel = CancelToken::new();
        let snapshot = vault
            .create_backup(BackupRequest::full(), &cancel)
            .await
            .unwrap()
            .snapshot_id
            .unwrap();

        let loaded = vault.load_snapshot(&snapshot, &cancel).await.unwrap();
        assert_eq!(loaded.resources.len(), 2);
    }

    #[tokio::test]
    async fn test_directory_operations_need_a_source() {
        let (paths, _temp_dir) = create_test_paths();
        let vault = Vault::builder(paths, Settings::default())
            .build()
            .await
            .unwrap();

        let err = vault
            .create_backup(BackupRequest::full(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::ConfigurationInvalid(_)));

        let health = vault.health_check().await;
        assert!(health.reachable);
        assert_eq!(
            vault.discard_partial_chunks(&CancelToken::new()).await.unwrap(),
            0
        );
    }
}
