//! Typed collections of directory records
//!
//! A `ResourceSet` holds the records of each resource type keyed by id,
//! plus the tombstones that say which ids have disappeared.

use std::collections::{BTreeMap, BTreeSet};

use super::resource::{ResourceKey, ResourceRecord, ResourceType, Tombstone};

/// Records and tombstones grouped by resource type, ordered by identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet {
    records: BTreeMap<ResourceType, BTreeMap<String, ResourceRecord>>,
    tombstones: BTreeMap<ResourceType, BTreeMap<String, Tombstone>>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from records, later duplicates replacing earlier ones
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = ResourceRecord>,
    {
        let mut set = Self::new();
        for record in records {
            set.insert(record);
        }
        set
    }

    /// Insert or replace a record, clearing any tombstone for the same id
    pub fn insert(&mut self, record: ResourceRecord) {
        let resource_type = record.resource_type();
        let id = record.id();
        if let Some(tombs) = self.tombstones.get_mut(&resource_type) {
            tombs.remove(&id);
        }
        self.records
            .entry(resource_type)
            .or_default()
            .insert(id, record);
    }

    /// Record a deletion, dropping the record if present
    pub fn add_tombstone(&mut self, tombstone: Tombstone) {
        if let Some(records) = self.records.get_mut(&tombstone.resource_type) {
            records.remove(&tombstone.id);
        }
        self.tombstones
            .entry(tombstone.resource_type)
            .or_default()
            .insert(tombstone.id.clone(), tombstone);
    }

    /// Records of one type, ordered by id
    pub fn records(&self, resource_type: ResourceType) -> impl Iterator<Item = &ResourceRecord> {
        self.records
            .get(&resource_type)
            .into_iter()
            .flat_map(|records| records.values())
    }

    pub fn tombstones(&self, resource_type: ResourceType) -> impl Iterator<Item = &Tombstone> {
        self.tombstones
            .get(&resource_type)
            .into_iter()
            .flat_map(|tombs| tombs.values())
    }

    /// Every record, in stage order then id order
    pub fn all_records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.records.values().flat_map(|records| records.values())
    }

    pub fn all_tombstones(&self) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.values().flat_map(|tombs| tombs.values())
    }

    pub fn ids(&self, resource_type: ResourceType) -> BTreeSet<String> {
        self.records
            .get(&resource_type)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceRecord> {
        self.records
            .get(&key.resource_type)
            .and_then(|records| records.get(&key.id))
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.get(key).is_some()
    }

    pub fn record_count(&self, resource_type: ResourceType) -> usize {
        self.records.get(&resource_type).map_or(0, |r| r.len())
    }

    pub fn tombstone_count(&self, resource_type: ResourceType) -> usize {
        self.tombstones.get(&resource_type).map_or(0, |t| t.len())
    }

    /// Total number of records across all types
    pub fn len(&self) -> usize {
        self.records.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.tombstones.values().all(|t| t.is_empty())
    }

    pub fn remove_record(&mut self, key: &ResourceKey) -> Option<ResourceRecord> {
        self.records
            .get_mut(&key.resource_type)
            .and_then(|records| records.remove(&key.id))
    }

    /// Replace one type wholesale, as a full snapshot does
    pub fn replace_type<I>(&mut self, resource_type: ResourceType, records: I)
    where
        I: IntoIterator<Item = ResourceRecord>,
    {
        let replaced: BTreeMap<String, ResourceRecord> = records
            .into_iter()
            .filter(|r| r.resource_type() == resource_type)
            .map(|r| (r.id(), r))
            .collect();
        self.records.insert(resource_type, replaced);
        self.tombstones.remove(&resource_type);
    }

    /// Replay an incremental delta: upsert its records, apply its tombstones
    pub fn apply_incremental(&mut self, delta: &ResourceSet) {
        for tombstone in delta.all_tombstones() {
            self.add_tombstone(tombstone.clone());
        }
        for record in delta.all_records() {
            self.insert(record.clone());
        }
    }

    /// Keep only the listed types
    pub fn retain_types(&mut self, types: &[ResourceType]) {
        self.records.retain(|t, _| types.contains(t));
        self.tombstones.retain(|t, _| types.contains(t));
    }

    /// Resource types with at least one record or tombstone
    pub fn types(&self) -> BTreeSet<ResourceType> {
        self.records
            .iter()
            .filter(|(_, r)| !r.is_empty())
            .map(|(t, _)| *t)
            .chain(
                self.tombstones
                    .iter()
                    .filter(|(_, t)| !t.is_empty())
                    .map(|(t, _)| *t),
            )
            .collect()
    }
}
