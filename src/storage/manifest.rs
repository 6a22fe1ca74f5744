//! Snapshot manifests
//!
//! A manifest indexes one snapshot: per resource type, the ordered chunk
//! list and the hash of the reassembled payload, plus a checksum over the
//! whole document. Manifests are stored as JSON at `manifests/<uuid>.json`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ResourceType, SnapshotId};

use super::chunk::{ChunkHash, ChunkRef};

/// Current manifest format
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Key prefix under which all manifests live
pub const MANIFEST_PREFIX: &str = "manifests/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Full,
    Incremental,
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotKind::Full => write!(f, "full"),
            SnapshotKind::Incremental => write!(f, "incremental"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub snapshot_id: SnapshotId,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    /// Full snapshot this chain starts from (incrementals only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_snapshot_id: Option<SnapshotId>,
    /// Previous snapshot in the chain (incrementals only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<SnapshotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub resources: BTreeMap<ResourceType, Vec<ChunkRef>>,
    pub payload_hashes: BTreeMap<ResourceType, ChunkHash>,
    #[serde(default)]
    pub record_counts: BTreeMap<ResourceType, usize>,
    #[serde(default)]
    pub tombstone_counts: BTreeMap<ResourceType, usize>,
    /// Requested types that could not be collected, with the error text
    #[serde(default)]
    pub incomplete_types: BTreeMap<ResourceType, String>,
    pub whole_snapshot_checksum: ChunkHash,
}

impl Manifest {
    pub fn new(snapshot_id: SnapshotId, kind: SnapshotKind, created_at: DateTime<Utc>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            snapshot_id,
            kind,
            created_at,
            base_snapshot_id: None,
            parent_snapshot_id: None,
            description: None,
            resources: BTreeMap::new(),
            payload_hashes: BTreeMap::new(),
            record_counts: BTreeMap::new(),
            tombstone_counts: BTreeMap::new(),
            incomplete_types: BTreeMap::new(),
            whole_snapshot_checksum: ChunkHash::from_bytes([0u8; 32]),
        }
    }

    pub fn storage_key(snapshot_id: &SnapshotId) -> String {
        format!("{}{}.json", MANIFEST_PREFIX, snapshot_id.as_uuid())
    }

    /// BLAKE3 over the canonical JSON of every field except the checksum
    pub fn compute_checksum(&self) -> ChunkHash {
        let mut canonical = self.clone();
        canonical.whole_snapshot_checksum = ChunkHash::from_bytes([0u8; 32]);
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        ChunkHash::of(&bytes)
    }

    /// Stamp the checksum; call after every other field is final
    pub fn seal(&mut self) {
        self.whole_snapshot_checksum = self.compute_checksum();
    }

    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.whole_snapshot_checksum
    }

    /// Every chunk hash referenced, duplicates included
    pub fn chunk_hashes(&self) -> impl Iterator<Item = &ChunkHash> {
        self.resources
            .values()
            .flat_map(|chunks| chunks.iter().map(|c| &c.content_hash))
    }

    /// Whether this snapshot holds a complete payload for the type
    pub fn is_complete_for(&self, resource_type: ResourceType) -> bool {
        self.resources.contains_key(&resource_type)
            && !self.incomplete_types.contains_key(&resource_type)
    }

    pub fn total_records(&self) -> usize {
        self.record_counts.values().sum()
    }

    /// Stored payload bytes before compression
    pub fn total_size(&self) -> u64 {
        self.resources
            .values()
            .flat_map(|chunks| chunks.iter().map(|c| c.size))
            .sum()
    }
}
