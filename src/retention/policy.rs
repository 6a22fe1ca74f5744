//! Retention rules
//!
//! A policy is a list of rules, each selecting some full snapshots to keep.
//! Bucketed rules (daily, weekly, monthly, yearly) keep the newest full
//! snapshot of each of the `count` most recent periods that have one.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::models::SnapshotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RetentionRule {
    /// The `count` newest full snapshots
    KeepLast { count: u32 },
    Daily { count: u32 },
    Weekly { count: u32 },
    Monthly { count: u32 },
    Yearly { count: u32 },
}

impl RetentionRule {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeepLast { .. } => "keep_last",
            Self::Daily { .. } => "daily",
            Self::Weekly { .. } => "weekly",
            Self::Monthly { .. } => "monthly",
            Self::Yearly { .. } => "yearly",
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            Self::KeepLast { count }
            | Self::Daily { count }
            | Self::Weekly { count }
            | Self::Monthly { count }
            | Self::Yearly { count } => *count,
        }
    }

    fn bucket(&self, at: &DateTime<Utc>) -> Option<String> {
        match self {
            Self::KeepLast { .. } => None,
            Self::Daily { .. } => Some(at.format("%Y-%m-%d").to_string()),
            Self::Weekly { .. } => {
                let week = at.iso_week();
                Some(format!("{}-W{:02}", week.year(), week.week()))
            }
            Self::Monthly { .. } => Some(at.format("%Y-%m").to_string()),
            Self::Yearly { .. } => Some(at.year().to_string()),
        }
    }

    /// Snapshots this rule keeps; `fulls` must be sorted newest first
    pub fn select(&self, fulls: &[(SnapshotId, DateTime<Utc>)]) -> BTreeSet<SnapshotId> {
        let limit = self.count() as usize;
        let mut kept = BTreeSet::new();
        let mut buckets = HashSet::new();

        for (snapshot_id, created_at) in fulls {
            match self.bucket(created_at) {
                None => {
                    if kept.len() == limit {
                        break;
                    }
                    kept.insert(*snapshot_id);
                }
                Some(bucket) => {
                    if buckets.contains(&bucket) {
                        continue;
                    }
                    if buckets.len() == limit {
                        break;
                    }
                    buckets.insert(bucket);
                    kept.insert(*snapshot_id);
                }
            }
        }
        kept
    }
}

impl fmt::Display for RetentionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.count())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub rules: Vec<RetentionRule>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                RetentionRule::Daily { count: 30 },
                RetentionRule::Monthly { count: 12 },
            ],
        }
    }
}

impl RetentionPolicy {
    pub fn new(rules: Vec<RetentionRule>) -> Self {
        Self { rules }
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.rules.is_empty() {
            return Err(VaultError::ConfigurationInvalid(
                "retention policy has no rules; it would prune every snapshot".into(),
            ));
        }
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.count() == 0 {
                return Err(VaultError::ConfigurationInvalid(format!(
                    "retention rule '{}' keeps nothing",
                    rule.kind()
                )));
            }
            if let Some(other) = self.rules[..i]
                .iter()
                .find(|r| r.kind() == rule.kind() && r.count() != rule.count())
            {
                return Err(VaultError::ConfigurationInvalid(format!(
                    "contradictory retention rules: '{}' and '{}'",
                    other, rule
                )));
            }
        }
        Ok(())
    }

    /// Union of every rule's selection
    pub fn select(&self, fulls: &[(SnapshotId, DateTime<Utc>)]) -> BTreeSet<SnapshotId> {
        self.rules.iter().flat_map(|rule| rule.select(fulls)).collect()
    }
}
