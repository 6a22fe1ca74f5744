//! Directory collection
//!
//! Reads directory state through a [`DirectorySource`] into a
//! [`ResourceSet`]. Independent resource types are fetched concurrently;
//! assignments are fetched last because they are only meaningful when their
//! principals and permission sets were collected too.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::directory::DirectorySource;
use crate::error::{VaultError, VaultResult};
use crate::models::{ResourceRecord, ResourceSet, ResourceType, Tombstone};
use crate::retry::{retry, RetryPolicy};

/// What to collect for one resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionWindow {
    pub resource_type: ResourceType,
    /// Only records modified after this instant; `None` collects everything
    pub since: Option<DateTime<Utc>>,
}

impl CollectionWindow {
    pub fn full(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            since: None,
        }
    }

    pub fn since(resource_type: ResourceType, since: DateTime<Utc>) -> Self {
        Self {
            resource_type,
            since: Some(since),
        }
    }
}

/// Result of a collection pass; per-type failures do not abort the others
#[derive(Debug, Default)]
pub struct CollectionOutcome {
    pub resources: ResourceSet,
    pub collected: BTreeSet<ResourceType>,
    pub errors: BTreeMap<ResourceType, VaultError>,
}

impl CollectionOutcome {
    pub fn succeeded(&self, resource_type: ResourceType) -> bool {
        self.collected.contains(&resource_type)
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

struct TypeCollection {
    resource_type: ResourceType,
    records: Vec<ResourceRecord>,
    tombstones: Vec<Tombstone>,
}

pub struct Collector {
    source: Arc<dyn DirectorySource>,
    workers: usize,
    retry: RetryPolicy,
}

impl Collector {
    pub fn new(source: Arc<dyn DirectorySource>, workers: usize, retry: RetryPolicy) -> Self {
        Self {
            source,
            workers: workers.max(1),
            retry,
        }
    }

    /// Collect every window.
    ///
    /// `baseline` is the materialized parent state; windows with a `since`
    /// diff it against the live id list to produce tombstones. Only
    /// cancellation fails the whole call.
    pub async fn collect(
        &self,
        windows: &[CollectionWindow],
        baseline: Option<&ResourceSet>,
        cancel: &CancelToken,
    ) -> VaultResult<CollectionOutcome> {
        let (dependent, independent): (Vec<CollectionWindow>, Vec<CollectionWindow>) = windows
            .iter()
            .copied()
            .partition(|w| !w.resource_type.dependencies().is_empty());

        let mut outcome = CollectionOutcome::default();

        let results: Vec<(ResourceType, VaultResult<TypeCollection>)> = stream::iter(independent)
            .map(|window| async move {
                (
                    window.resource_type,
                    self.collect_type(window, baseline, cancel).await,
                )
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for (resource_type, result) in results {
            self.absorb(&mut outcome, resource_type, result)?;
        }

        for window in dependent {
            let failed: Vec<String> = window
                .resource_type
                .dependencies()
                .iter()
                .filter(|dep| outcome.errors.contains_key(dep))
                .map(|dep| dep.to_string())
                .collect();

            if !failed.is_empty() {
                warn!(
                    "Skipping {} collection, dependencies failed: {}",
                    window.resource_type,
                    failed.join(", ")
                );
                outcome.errors.insert(
                    window.resource_type,
                    VaultError::DependencyUnsatisfied {
                        resource: window.resource_type.to_string(),
                        reason: format!("collection failed for {}", failed.join(", ")),
                    },
                );
                continue;
            }

            let result = self.collect_type(window, baseline, cancel).await;
            self.absorb(&mut outcome, window.resource_type, result)?;
        }

        Ok(outcome)
    }

    fn absorb(
        &self,
        outcome: &mut CollectionOutcome,
        resource_type: ResourceType,
        result: VaultResult<TypeCollection>,
    ) -> VaultResult<()> {
        match result {
            Ok(collection) => {
                info!(
                    "Collected {} {} record(s), {} deletion(s)",
                    collection.records.len(),
                    collection.resource_type,
                    collection.tombstones.len()
                );
                for tombstone in collection.tombstones {
                    outcome.resources.add_tombstone(tombstone);
                }
                for record in collection.records {
                    outcome.resources.insert(record);
                }
                outcome.collected.insert(collection.resource_type);
                Ok(())
            }
            Err(VaultError::Cancelled) => Err(VaultError::Cancelled),
            Err(err) => {
                warn!("Collecting {} failed: {}", resource_type, err);
                outcome.errors.insert(resource_type, err);
                Ok(())
            }
        }
    }

    async fn collect_type(
        &self,
        window: CollectionWindow,
        baseline: Option<&ResourceSet>,
        cancel: &CancelToken,
    ) -> VaultResult<TypeCollection> {
        let resource_type = window.resource_type;
        let operation = format!("list {}", resource_type);
        let listed = retry(&self.retry, &operation, cancel, || {
            self.source.list(resource_type, window.since)
        })
        .await?;

        let records: Vec<ResourceRecord> = listed
            .into_iter()
            .filter(|r| r.resource_type() == resource_type)
            .filter(|r| match (window.since, r.modified_at()) {
                (Some(since), Some(modified)) => modified > since,
                _ => true,
            })
            .collect();

        let mut tombstones = Vec::new();
        if let (Some(since), Some(baseline)) = (window.since, baseline) {
            let operation = format!("list {} ids", resource_type);
            let live = retry(&self.retry, &operation, cancel, || {
                self.source.list_ids(resource_type)
            })
            .await?;
            let deleted_at = Utc::now();
            tombstones = baseline
                .records(resource_type)
                .filter(|r| !live.contains(&r.id()))
                .map(|r| Tombstone {
                    resource_type,
                    id: r.id(),
                    deleted_at,
                    last_known: Some(r.clone()),
                })
                .collect();
            debug!(
                "{} {} id(s) live, {} deleted since {}",
                live.len(),
                resource_type,
                tombstones.len(),
                since
            );
        }

        Ok(TypeCollection {
            resource_type,
            records,
            tombstones,
        })
    }
}
