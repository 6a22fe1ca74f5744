//! Snapshot creation, materialization and validation
//!
//! - `BackupManager`: runs a backup end to end and lists snapshots.
//! - `SnapshotLoader`: replays a base full snapshot and its incrementals
//!   into the state a snapshot stands for.
//! - `validate_snapshot`: re-reads and re-hashes everything a manifest
//!   references.
//!
//! # Snapshot layout
//!
//! Each resource type is stored as one JSON payload (`TypePayload`) holding
//! its records and tombstones, chunked through the storage engine. The
//! manifest maps each type to its chunk list and payload hash and carries a
//! checksum over itself.
//!
//! # Example
//!
//! ```rust,ignore
//! let report = manager
//!     .create_backup(BackupRequest::incremental(), &CancelToken::new())
//!     .await?;
//! println!("{}", report.summary());
//! ```

mod loader;
mod manager;
mod payload;
mod validation;

pub use loader::{MaterializedSnapshot, SnapshotLoader};
pub use manager::{BackupManager, BackupPhase, BackupReport, BackupRequest, SnapshotInfo};
pub use payload::{TypePayload, PAYLOAD_FORMAT_VERSION};
pub use validation::{validate_snapshot, ValidationIssue, ValidationReport};
