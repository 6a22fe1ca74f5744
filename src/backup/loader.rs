//! Snapshot materialization
//!
//! Rebuilds the directory state a snapshot stands for: the base full
//! snapshot, then every incremental of its chain up to the target, each
//! manifest checksum-verified before its payloads are trusted.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::payload::TypePayload;
use crate::cancel::CancelToken;
use crate::error::{VaultError, VaultResult};
use crate::models::{ResourceSet, ResourceType, SnapshotId};
use crate::storage::{Manifest, SnapshotKind, StorageEngine};

/// State of the directory as captured by one snapshot
#[derive(Debug, Clone)]
pub struct MaterializedSnapshot {
    /// Manifest of the requested snapshot
    pub manifest: Manifest,
    /// Snapshot ids replayed, base first
    pub chain: Vec<SnapshotId>,
    /// Final records, plus tombstones for deletions since the base
    pub resources: ResourceSet,
    /// Types with complete data somewhere in the chain
    pub available_types: BTreeSet<ResourceType>,
    /// Types the requested snapshot failed to collect, with the error text
    pub incomplete_types: BTreeMap<ResourceType, String>,
}

impl MaterializedSnapshot {
    pub fn snapshot_id(&self) -> SnapshotId {
        self.manifest.snapshot_id
    }
}

pub struct SnapshotLoader {
    store: Arc<StorageEngine>,
}

impl SnapshotLoader {
    pub fn new(store: Arc<StorageEngine>) -> Self {
        Self { store }
    }

    /// Fetch a manifest and reject it unless its checksum holds
    pub async fn verified_manifest(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<Manifest> {
        let manifest = self.store.get_manifest(snapshot_id, cancel).await?;
        if !manifest.verify_checksum() {
            return Err(VaultError::corruption(
                format!("manifest {}", snapshot_id),
                "whole-snapshot checksum mismatch",
            ));
        }
        Ok(manifest)
    }

    /// Manifests from the base full snapshot to `snapshot_id`, base first
    pub async fn chain(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<Vec<Manifest>> {
        let target = self.verified_manifest(snapshot_id, cancel).await?;
        let mut visited = HashSet::from([target.snapshot_id]);
        let mut chain = vec![target];

        loop {
            let current = &chain[chain.len() - 1];
            if current.kind == SnapshotKind::Full {
                break;
            }
            let parent_id = current.parent_snapshot_id.ok_or_else(|| {
                VaultError::corruption(
                    format!("manifest {}", current.snapshot_id),
                    "incremental snapshot without a parent",
                )
            })?;
            if !visited.insert(parent_id) {
                return Err(VaultError::corruption(
                    format!("manifest {}", current.snapshot_id),
                    "snapshot chain loops back on itself",
                ));
            }
            let child = current.snapshot_id;
            let parent = match self.verified_manifest(&parent_id, cancel).await {
                Ok(parent) => parent,
                Err(e) if e.is_not_found() => {
                    return Err(VaultError::DependencyUnsatisfied {
                        resource: format!("snapshot {}", child),
                        reason: format!("parent snapshot {} is missing", parent_id),
                    })
                }
                Err(e) => return Err(e),
            };
            chain.push(parent);
        }

        chain.reverse();
        let base_id = chain[0].snapshot_id;
        if let Some(stray) = chain
            .iter()
            .skip(1)
            .find(|m| m.base_snapshot_id != Some(base_id))
        {
            return Err(VaultError::corruption(
                format!("manifest {}", stray.snapshot_id),
                format!("chain does not lead back to its base {}", base_id),
            ));
        }
        Ok(chain)
    }

    /// Decode one type of one snapshot
    pub async fn read_type(
        &self,
        manifest: &Manifest,
        resource_type: ResourceType,
        cancel: &CancelToken,
    ) -> VaultResult<Option<TypePayload>> {
        let (Some(chunks), Some(hash)) = (
            manifest.resources.get(&resource_type),
            manifest.payload_hashes.get(&resource_type),
        ) else {
            return Ok(None);
        };
        let bytes = self.store.read_payload(chunks, hash, cancel).await?;
        TypePayload::decode(resource_type, &bytes).map(Some)
    }

    pub async fn load(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<MaterializedSnapshot> {
        let chain = self.chain(snapshot_id, cancel).await?;
        let mut resources = ResourceSet::new();
        let mut available_types = BTreeSet::new();

        for manifest in &chain {
            for resource_type in ResourceType::ALL {
                if !manifest.is_complete_for(resource_type) {
                    continue;
                }
                if let Some(payload) = self.read_type(manifest, resource_type, cancel).await? {
                    // A delta without a complete earlier listing is not a usable state
                    if payload.full_listing || available_types.contains(&resource_type) {
                        available_types.insert(resource_type);
                        payload.apply_to(&mut resources);
                    }
                }
            }
            debug!(
                snapshot = %manifest.snapshot_id,
                kind = %manifest.kind,
                "Replayed snapshot"
            );
        }

        let manifest = chain
            .last()
            .cloned()
            .ok_or_else(|| VaultError::snapshot_not_found(snapshot_id.to_string()))?;
        Ok(MaterializedSnapshot {
            chain: chain.iter().map(|m| m.snapshot_id).collect(),
            incomplete_types: manifest.incomplete_types.clone(),
            manifest,
            resources,
            available_types,
        })
    }
}
