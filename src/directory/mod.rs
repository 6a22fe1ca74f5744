//! Directory access
//!
//! [`DirectorySource`] is the seam to the live identity directory. The
//! engine reads through it during backup and writes through it during
//! restore; it never talks to a directory API directly.

mod memory;

pub use memory::InMemoryDirectory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::VaultResult;
use crate::models::{ResourceKey, ResourceRecord, ResourceType};

/// A mutation applied to the target directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryAction {
    Create(ResourceRecord),
    Update(ResourceRecord),
    Delete(ResourceKey),
}

impl DirectoryAction {
    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Create(record) | Self::Update(record) => record.key(),
            Self::Delete(key) => key.clone(),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }
}

#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Records of one type, only those modified after `since` when given.
    ///
    /// Sources that cannot filter server-side may return more; the collector
    /// filters again.
    async fn list(
        &self,
        resource_type: ResourceType,
        since: Option<DateTime<Utc>>,
    ) -> VaultResult<Vec<ResourceRecord>>;

    /// Every id currently present, used to detect deletions
    async fn list_ids(&self, resource_type: ResourceType) -> VaultResult<BTreeSet<String>> {
        Ok(self
            .list(resource_type, None)
            .await?
            .iter()
            .map(ResourceRecord::id)
            .collect())
    }

    async fn get_current(
        &self,
        resource_type: ResourceType,
        id: &str,
    ) -> VaultResult<Option<ResourceRecord>>;

    async fn apply(&self, action: &DirectoryAction) -> VaultResult<()>;
}
