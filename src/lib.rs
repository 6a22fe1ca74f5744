//! idvault - backup and restore engine for cloud identity directories
//!
//! This library snapshots the users, groups, permission sets and account
//! assignments of an identity directory into a content-addressed,
//! deduplicated chunk store, and restores them in dependency order with
//! conflict handling and optional cross-account id remapping.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - `config`: Configuration and path management
//! - `error`: Custom error types
//! - `models`: Directory records, resource sets and engine ids
//! - `directory`: The `DirectorySource` seam and an in-memory directory
//! - `collector`: Full and incremental collection from a directory
//! - `storage`: Backends and the chunk store (dedup, zstd, AES-GCM)
//! - `backup`: Snapshot creation, materialization and validation
//! - `restore`: Restore planning, conflict resolution and execution
//! - `retention`: Retention policies and pruning
//! - `audit`: JSON-lines audit log of restore mutations
//! - `engine`: The `Vault` facade tying it all together
//!
//! # Example
//!
//! ```rust,ignore
//! use idvault::config::{Settings, VaultPaths};
//! use idvault::{BackupRequest, CancelToken, Vault};
//!
//! let paths = VaultPaths::new()?;
//! let settings = Settings::load_or_create(&paths)?;
//! let vault = Vault::builder(paths, settings)
//!     .directory(directory)
//!     .build()
//!     .await?;
//! let report = vault
//!     .create_backup(BackupRequest::incremental(), &CancelToken::new())
//!     .await?;
//! ```

pub mod audit;
pub mod backup;
pub mod cancel;
pub mod cli;
pub mod collector;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod engine;
pub mod error;
pub mod models;
pub mod restore;
pub mod retention;
pub mod retry;
pub mod storage;

pub use backup::{BackupReport, BackupRequest, ValidationReport};
pub use cancel::CancelToken;
pub use engine::{HealthReport, Vault, VaultBuilder};
pub use error::{VaultError, VaultResult};
pub use restore::{AccountMapping, ConflictStrategy, RestoreOptions, RestorePlan, RestoreResult};
pub use retention::{RetentionPolicy, RetentionReport};
