//! Snapshot validation
//!
//! Re-walks a manifest and checks everything it depends on. Problems are
//! collected rather than returned early, so one run lists every missing or
//! corrupt chunk.

use std::collections::{HashMap, HashSet};
use std::fmt;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::{VaultError, VaultResult};
use crate::models::{ResourceType, RunStatus, SnapshotId};
use crate::storage::{ChunkHash, Manifest, SnapshotKind, StorageEngine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    UnreadableManifest { reason: String },
    ChecksumMismatch,
    MissingBase { snapshot_id: SnapshotId },
    MissingParent { snapshot_id: SnapshotId },
    MissingChunk { resource_type: ResourceType, chunk: ChunkHash },
    CorruptChunk { resource_type: ResourceType, chunk: ChunkHash, reason: String },
    /// The chunk could not be fetched or opened, so its state is unknown
    UnreadableChunk { resource_type: ResourceType, chunk: ChunkHash, error: String },
    /// All chunks verified but the reassembled payload does not hash right
    PayloadMismatch { resource_type: ResourceType },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnreadableManifest { reason } => write!(f, "manifest unreadable: {}", reason),
            Self::ChecksumMismatch => write!(f, "whole-snapshot checksum mismatch"),
            Self::MissingBase { snapshot_id } => write!(f, "base snapshot {} missing", snapshot_id),
            Self::MissingParent { snapshot_id } => {
                write!(f, "parent snapshot {} missing", snapshot_id)
            }
            Self::MissingChunk {
                resource_type,
                chunk,
            } => write!(f, "{} chunk {} missing", resource_type, chunk),
            Self::CorruptChunk {
                resource_type,
                chunk,
                reason,
            } => write!(f, "{} chunk {} corrupt: {}", resource_type, chunk, reason),
            Self::UnreadableChunk {
                resource_type,
                chunk,
                error,
            } => write!(f, "{} chunk {} unreadable: {}", resource_type, chunk, error),
            Self::PayloadMismatch { resource_type } => {
                write!(f, "{} payload hash mismatch", resource_type)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub snapshot_id: SnapshotId,
    pub chunks_checked: usize,
    pub chunks_healthy: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn new(snapshot_id: SnapshotId) -> Self {
        Self {
            snapshot_id,
            chunks_checked: 0,
            chunks_healthy: 0,
            issues: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn status(&self) -> RunStatus {
        if self.is_valid() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    pub fn missing_chunks(&self) -> Vec<ChunkHash> {
        self.issues
            .iter()
            .filter_map(|issue| match issue {
                ValidationIssue::MissingChunk { chunk, .. } => Some(*chunk),
                _ => None,
            })
            .collect()
    }

    pub fn corrupt_chunks(&self) -> Vec<ChunkHash> {
        self.issues
            .iter()
            .filter_map(|issue| match issue {
                ValidationIssue::CorruptChunk { chunk, .. } => Some(*chunk),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!(
                "Snapshot {} is valid ({} chunks verified)",
                self.snapshot_id, self.chunks_checked
            )
        } else {
            format!(
                "Snapshot {} is INVALID: {} issue(s), {}/{} chunks healthy",
                self.snapshot_id,
                self.issues.len(),
                self.chunks_healthy,
                self.chunks_checked
            )
        }
    }
}

enum ChunkCheck {
    Healthy(Vec<u8>),
    Missing,
    Corrupt(String),
    Unreadable(String),
}

/// Validate one snapshot.
///
/// `Err` only when the manifest does not exist or storage fails outright;
/// everything else becomes an issue in the report.
pub async fn validate_snapshot(
    store: &StorageEngine,
    snapshot_id: &SnapshotId,
    cancel: &CancelToken,
) -> VaultResult<ValidationReport> {
    let mut report = ValidationReport::new(*snapshot_id);

    let manifest = match store.get_manifest(snapshot_id, cancel).await {
        Ok(manifest) => manifest,
        Err(VaultError::Corruption { reason, .. }) => {
            report
                .issues
                .push(ValidationIssue::UnreadableManifest { reason });
            return Ok(report);
        }
        Err(e) => return Err(e),
    };

    if !manifest.verify_checksum() {
        report.issues.push(ValidationIssue::ChecksumMismatch);
    }

    if manifest.kind == SnapshotKind::Incremental {
        check_lineage(store, &manifest, &mut report, cancel).await?;
    }

    // Each distinct chunk is fetched once, even when several types share it
    let mut seen: HashSet<ChunkHash> = HashSet::new();
    let unique: Vec<ChunkHash> = manifest
        .chunk_hashes()
        .copied()
        .filter(|hash| seen.insert(*hash))
        .collect();

    let workers = store.options().workers.max(1);
    let results: Vec<(ChunkHash, VaultResult<Vec<u8>>)> = stream::iter(unique)
        .map(|hash| async move { (hash, store.read_chunk(&hash, cancel).await) })
        .buffered(workers)
        .collect()
        .await;

    let mut checks: HashMap<ChunkHash, ChunkCheck> = HashMap::new();
    for (hash, result) in results {
        let check = match result {
            Ok(bytes) => ChunkCheck::Healthy(bytes),
            Err(e) if e.is_not_found() => ChunkCheck::Missing,
            Err(VaultError::Corruption { reason, .. }) => ChunkCheck::Corrupt(reason),
            Err(VaultError::Cancelled) => return Err(VaultError::Cancelled),
            Err(e) => ChunkCheck::Unreadable(e.to_string()),
        };
        checks.insert(hash, check);
    }

    report.chunks_checked = checks.len();
    let mut reported: HashSet<ChunkHash> = HashSet::new();
    for (resource_type, chunks) in &manifest.resources {
        let mut payload = Vec::new();
        let mut intact = true;
        for chunk in chunks {
            let hash = chunk.content_hash;
            match checks.get(&hash) {
                Some(ChunkCheck::Healthy(bytes)) => payload.extend_from_slice(bytes),
                Some(ChunkCheck::Missing) => {
                    intact = false;
                    if reported.insert(hash) {
                        report.issues.push(ValidationIssue::MissingChunk {
                            resource_type: *resource_type,
                            chunk: hash,
                        });
                    }
                }
                Some(ChunkCheck::Corrupt(reason)) => {
                    intact = false;
                    if reported.insert(hash) {
                        report.issues.push(ValidationIssue::CorruptChunk {
                            resource_type: *resource_type,
                            chunk: hash,
                            reason: reason.clone(),
                        });
                    }
                }
                Some(ChunkCheck::Unreadable(error)) => {
                    intact = false;
                    if reported.insert(hash) {
                        report.issues.push(ValidationIssue::UnreadableChunk {
                            resource_type: *resource_type,
                            chunk: hash,
                            error: error.clone(),
                        });
                    }
                }
                None => intact = false,
            }
        }

        let expected = manifest.payload_hashes.get(resource_type);
        if intact && expected != Some(&ChunkHash::of(&payload)) {
            report.issues.push(ValidationIssue::PayloadMismatch {
                resource_type: *resource_type,
            });
        }
    }

    report.chunks_healthy = checks
        .values()
        .filter(|c| matches!(c, ChunkCheck::Healthy(_)))
        .count();

    if report.is_valid() {
        info!("{}", report.summary());
    } else {
        for issue in &report.issues {
            warn!(snapshot = %snapshot_id, "Validation issue: {}", issue);
        }
    }
    Ok(report)
}

async fn check_lineage(
    store: &StorageEngine,
    manifest: &Manifest,
    report: &mut ValidationReport,
    cancel: &CancelToken,
) -> VaultResult<()> {
    if let Some(base) = manifest.base_snapshot_id {
        if !snapshot_exists(store, &base, cancel).await? {
            report
                .issues
                .push(ValidationIssue::MissingBase { snapshot_id: base });
        }
    } else {
        report.issues.push(ValidationIssue::UnreadableManifest {
            reason: "incremental snapshot without a base".into(),
        });
    }

    if let Some(parent) = manifest.parent_snapshot_id {
        if Some(parent) != manifest.base_snapshot_id && !snapshot_exists(store, &parent, cancel).await? {
            report
                .issues
                .push(ValidationIssue::MissingParent { snapshot_id: parent });
        }
    }
    Ok(())
}

async fn snapshot_exists(
    store: &StorageEngine,
    snapshot_id: &SnapshotId,
    cancel: &CancelToken,
) -> VaultResult<bool> {
    match store.get_manifest(snapshot_id, cancel).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        // Present but damaged still counts as present; its own validation reports it
        Err(VaultError::Corruption { .. }) => Ok(true),
        Err(e) => Err(e),
    }
}
