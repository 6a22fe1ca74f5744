//! Engine settings for idvault
//!
//! Manages storage backend selection, chunking, compression and encryption
//! preferences, worker counts, remote-call timeouts and the retention policy.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::paths::VaultPaths;
use crate::crypto::key_derivation::KeyDerivationParams;
use crate::error::VaultError;
use crate::retention::RetentionPolicy;
use crate::retry::RetryPolicy;

/// Smallest chunk size accepted by [`Settings::validate`]
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
/// Largest chunk size accepted by [`Settings::validate`]
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Which storage backend holds chunks and manifests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendSettings {
    /// Local directory; `None` means `<base_dir>/store`
    Filesystem {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<PathBuf>,
    },
    /// Bucket in an object store, every key placed under `prefix`
    ObjectStorage {
        bucket: String,
        #[serde(default)]
        prefix: String,
    },
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self::Filesystem { root: None }
    }
}

/// Compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// zstd level (1-22)
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_compression_level(),
        }
    }
}

/// Encryption settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionSettings {
    /// Whether new chunks are encrypted
    #[serde(default)]
    pub enabled: bool,

    /// Key derivation parameters used when the key comes from a passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_params: Option<KeyDerivationParams>,
}

/// Chunk store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: BackendSettings,

    /// Fixed chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default)]
    pub compression: CompressionSettings,

    #[serde(default)]
    pub encryption: EncryptionSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: BackendSettings::default(),
            chunk_size: default_chunk_size(),
            compression: CompressionSettings::default(),
            encryption: EncryptionSettings::default(),
        }
    }
}

/// Remote call behaviour shared by directory and backend calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Per-attempt deadline
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts before a retryable failure becomes terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Engine settings for idvault
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Schema version for migration support
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    #[serde(default)]
    pub storage: StorageSettings,

    /// Bounded worker count for collection, chunk I/O and restore execution
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub remote: RemoteSettings,

    /// Policy applied by `prune` and [`crate::Vault::enforce_retention`]
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Record every restore mutation in the audit log
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

fn default_schema_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_workers() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            storage: StorageSettings::default(),
            workers: default_workers(),
            remote: RemoteSettings::default(),
            retention: RetentionPolicy::default(),
            audit_enabled: true,
        }
    }
}

impl Settings {
    /// Load settings from disk, or create default settings if file doesn't exist
    pub fn load_or_create(paths: &VaultPaths) -> Result<Self, VaultError> {
        let settings_path = paths.settings_file();

        if settings_path.exists() {
            let contents = std::fs::read_to_string(&settings_path)
                .map_err(|e| VaultError::Io(format!("Failed to read settings file: {}", e)))?;

            let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
                VaultError::ConfigurationInvalid(format!("Failed to parse settings file: {}", e))
            })?;

            Ok(settings)
        } else {
            // Don't save yet - let caller decide when to persist
            Ok(Settings::default())
        }
    }

    /// Save settings to disk
    pub fn save(&self, paths: &VaultPaths) -> Result<(), VaultError> {
        paths.ensure_directories()?;
        crate::storage::file_io::write_json_atomic(paths.settings_file(), self)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), VaultError> {
        let storage = &self.storage;
        if storage.chunk_size < MIN_CHUNK_SIZE || storage.chunk_size > MAX_CHUNK_SIZE {
            return Err(VaultError::ConfigurationInvalid(format!(
                "chunk_size must be between {} and {} bytes, got {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, storage.chunk_size
            )));
        }
        if storage.compression.enabled && !(1..=22).contains(&storage.compression.level) {
            return Err(VaultError::ConfigurationInvalid(format!(
                "compression level must be between 1 and 22, got {}",
                storage.compression.level
            )));
        }
        if let BackendSettings::ObjectStorage { bucket, .. } = &storage.backend {
            if bucket.trim().is_empty() {
                return Err(VaultError::ConfigurationInvalid(
                    "object storage bucket must not be empty".into(),
                ));
            }
        }
        if self.workers == 0 {
            return Err(VaultError::ConfigurationInvalid(
                "workers must be at least 1".into(),
            ));
        }
        if self.remote.timeout_ms == 0 || self.remote.max_attempts == 0 {
            return Err(VaultError::ConfigurationInvalid(
                "remote timeout and max_attempts must be non-zero".into(),
            ));
        }
        if self.remote.initial_backoff_ms > self.remote.max_backoff_ms {
            return Err(VaultError::ConfigurationInvalid(format!(
                "initial backoff ({}ms) exceeds max backoff ({}ms)",
                self.remote.initial_backoff_ms, self.remote.max_backoff_ms
            )));
        }
        self.retention.validate()
    }

    /// Resolve the filesystem backend root against the data directory
    pub fn filesystem_root(&self, paths: &VaultPaths) -> Option<PathBuf> {
        match &self.storage.backend {
            BackendSettings::Filesystem { root } => {
                Some(root.clone().unwrap_or_else(|| paths.store_dir()))
            }
            BackendSettings::ObjectStorage { .. } => None,
        }
    }

    /// Retry policy for remote calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.remote.max_attempts,
            initial_backoff: Duration::from_millis(self.remote.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.remote.max_backoff_ms),
            timeout: Duration::from_millis(self.remote.timeout_ms),
        }
    }
}
