//! Storage layer for idvault
//!
//! A [`StorageBackend`] is a flat key/value store (local directory or object
//! bucket). The [`StorageEngine`] sits on top of it and provides chunking,
//! deduplication, compression, encryption and manifest handling.

pub mod backend;
pub mod chunk;
pub mod compression;
pub mod engine;
pub mod file_io;
pub mod filesystem;
pub mod manifest;
pub mod object;

use std::sync::Arc;

pub use backend::StorageBackend;
pub use chunk::{ChunkHash, ChunkRef, StoredPayload};
pub use engine::{ChunkStoreOptions, StorageEngine, StoreStats};
pub use file_io::write_json_atomic;
pub use filesystem::FilesystemBackend;
pub use manifest::{Manifest, SnapshotKind};
pub use object::{InMemoryObjectClient, ObjectClient, ObjectStorageBackend};

use crate::config::paths::VaultPaths;
use crate::config::settings::{BackendSettings, Settings};
use crate::error::{VaultError, VaultResult};

/// Build the backend selected in settings.
///
/// Object storage needs a caller-supplied client; there is no default wire
/// client.
pub async fn open_backend(
    settings: &Settings,
    paths: &VaultPaths,
    object_client: Option<Arc<dyn ObjectClient>>,
) -> VaultResult<Arc<dyn StorageBackend>> {
    match &settings.storage.backend {
        BackendSettings::Filesystem { .. } => {
            let root = settings
                .filesystem_root(paths)
                .unwrap_or_else(|| paths.store_dir());
            Ok(Arc::new(FilesystemBackend::open(root).await?))
        }
        BackendSettings::ObjectStorage { bucket, prefix } => {
            let client = object_client.ok_or_else(|| {
                VaultError::ConfigurationInvalid(format!(
                    "object storage backend for bucket '{}' needs an object client",
                    bucket
                ))
            })?;
            Ok(Arc::new(ObjectStorageBackend::new(client, bucket.clone(), prefix)))
        }
    }
}

/// Chunk store options derived from settings
pub fn chunk_store_options(settings: &Settings) -> ChunkStoreOptions {
    let storage = &settings.storage;
    ChunkStoreOptions {
        chunk_size: storage.chunk_size,
        compression_level: storage
            .compression
            .enabled
            .then_some(storage.compression.level),
        encrypt: storage.encryption.enabled,
        workers: settings.workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_default_filesystem_backend() {
        let temp_dir = TempDir::new().unwrap();
        let paths = VaultPaths::with_base_dir(temp_dir.path().to_path_buf());
        let backend = open_backend(&Settings::default(), &paths, None)
            .await
            .unwrap();

        assert_eq!(backend.name(), "filesystem");
        assert!(temp_dir.path().join("store").is_dir());
    }

    #[tokio::test]
    async fn test_object_backend_needs_client() {
        let temp_dir = TempDir::new().unwrap();
        let paths = VaultPaths::with_base_dir(temp_dir.path().to_path_buf());
        let mut settings = Settings::default();
        settings.storage.backend = BackendSettings::ObjectStorage {
            bucket: "backups".into(),
            prefix: String::new(),
        };

        let err = open_backend(&settings, &paths, None).await.err().unwrap();
        assert!(matches!(err, VaultError::ConfigurationInvalid(_)));

        let client: Arc<dyn ObjectClient> =
            Arc::new(InMemoryObjectClient::with_buckets(["backups"]));
        let backend = open_backend(&settings, &paths, Some(client)).await.unwrap();
        assert_eq!(backend.name(), "object");
        backend.health_check().await.unwrap();
    }

    #[test]
    fn test_compression_disabled_maps_to_none() {
        let mut settings = Settings::default();
        settings.storage.compression.enabled = false;
        assert_eq!(chunk_store_options(&settings).compression_level, None);
    }
}
