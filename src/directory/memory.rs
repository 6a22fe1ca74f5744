//! In-process directory
//!
//! Backs tests and offline dry runs. Failures can be injected per resource
//! type (for listing) and per resource (for mutations).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{DirectoryAction, DirectorySource};
use crate::error::{VaultError, VaultResult};
use crate::models::{ResourceKey, ResourceRecord, ResourceType};

/// Failure scripted for the next `remaining` calls
#[derive(Debug, Clone)]
struct Injected {
    remaining: usize,
    error: VaultError,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    records: RwLock<BTreeMap<ResourceKey, ResourceRecord>>,
    list_failures: RwLock<HashMap<ResourceType, Injected>>,
    apply_failures: RwLock<HashMap<ResourceKey, Injected>>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    apply_calls: AtomicUsize,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pre-populated with records
    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = ResourceRecord>,
    {
        let directory = Self::new();
        for record in records {
            directory.upsert(record);
        }
        directory
    }

    /// Insert or replace without any validation
    pub fn upsert(&self, record: ResourceRecord) {
        self.records.write().insert(record.key(), record);
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        self.records.write().remove(key)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        self.records.read().get(key).cloned()
    }

    /// Every record, ordered by type then id
    pub fn snapshot(&self) -> Vec<ResourceRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn count(&self, resource_type: ResourceType) -> usize {
        self.records
            .read()
            .keys()
            .filter(|k| k.resource_type == resource_type)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Fail the next `times` list calls for a type
    pub fn fail_list(&self, resource_type: ResourceType, times: usize, error: VaultError) {
        self.list_failures.write().insert(
            resource_type,
            Injected {
                remaining: times,
                error,
            },
        );
    }

    /// Fail the next `times` mutations of one resource
    pub fn fail_apply(&self, key: ResourceKey, times: usize, error: VaultError) {
        self.apply_failures.write().insert(
            key,
            Injected {
                remaining: times,
                error,
            },
        );
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    fn take_failure<K>(failures: &RwLock<HashMap<K, Injected>>, key: &K) -> Option<VaultError>
    where
        K: std::hash::Hash + Eq,
    {
        let mut failures = failures.write();
        let injected = failures.get_mut(key)?;
        if injected.remaining == 0 {
            return None;
        }
        injected.remaining -= 1;
        Some(injected.error.clone())
    }

    fn ensure_referents(
        records: &BTreeMap<ResourceKey, ResourceRecord>,
        record: &ResourceRecord,
    ) -> VaultResult<()> {
        for reference in record.references() {
            if !records.contains_key(&reference) {
                return Err(VaultError::DependencyUnsatisfied {
                    resource: record.key().to_string(),
                    reason: format!("{} does not exist", reference),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DirectorySource for InMemoryDirectory {
    async fn list(
        &self,
        resource_type: ResourceType,
        since: Option<DateTime<Utc>>,
    ) -> VaultResult<Vec<ResourceRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = Self::take_failure(&self.list_failures, &resource_type) {
            return Err(error);
        }
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.resource_type() == resource_type)
            .filter(|r| match (since, r.modified_at()) {
                (Some(since), Some(modified)) => modified > since,
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn list_ids(&self, resource_type: ResourceType) -> VaultResult<BTreeSet<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = Self::take_failure(&self.list_failures, &resource_type) {
            return Err(error);
        }
        Ok(self
            .records
            .read()
            .keys()
            .filter(|k| k.resource_type == resource_type)
            .map(|k| k.id.clone())
            .collect())
    }

    async fn get_current(
        &self,
        resource_type: ResourceType,
        id: &str,
    ) -> VaultResult<Option<ResourceRecord>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(&ResourceKey::new(resource_type, id)))
    }

    async fn apply(&self, action: &DirectoryAction) -> VaultResult<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let key = action.key();
        if let Some(error) = Self::take_failure(&self.apply_failures, &key) {
            return Err(error);
        }

        let mut records = self.records.write();
        match action {
            DirectoryAction::Create(record) => {
                if records.contains_key(&key) {
                    return Err(VaultError::Directory(format!("{} already exists", key)));
                }
                Self::ensure_referents(&records, record)?;
                records.insert(key, record.clone());
            }
            DirectoryAction::Update(record) => {
                if !records.contains_key(&key) {
                    return Err(VaultError::resource_not_found(key.to_string()));
                }
                Self::ensure_referents(&records, record)?;
                records.insert(key, record.clone());
            }
            DirectoryAction::Delete(_) => {
                if records.remove(&key).is_none() {
                    return Err(VaultError::resource_not_found(key.to_string()));
                }
            }
        }
        Ok(())
    }
}
