//! Cross-account identifier remapping
//!
//! Restoring into a different directory or account set means every
//! identifier in the snapshot has to be translated. The mapping must cover
//! every id the snapshot references; a partial mapping would silently
//! restore assignments against the wrong principals.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::models::{Assignment, ResourceRecord, ResourceSet, ResourceType, Tombstone};

/// Source id to target id tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMapping {
    /// Identity-store ids: users, groups, group members, assignment principals
    #[serde(default)]
    pub principals: BTreeMap<String, String>,
    #[serde(default)]
    pub permission_sets: BTreeMap<String, String>,
    #[serde(default)]
    pub accounts: BTreeMap<String, String>,
}

impl AccountMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_principal(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.principals.insert(source.into(), target.into());
        self
    }

    pub fn map_permission_set(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.permission_sets.insert(source.into(), target.into());
        self
    }

    pub fn map_account(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.accounts.insert(source.into(), target.into());
        self
    }

    /// Rewrite every id in the set.
    ///
    /// Fails with `MappingIncomplete` naming every unmapped id (prefixed by
    /// its table) when the mapping is not total over the set.
    pub fn apply(&self, set: &ResourceSet) -> VaultResult<ResourceSet> {
        let mut remapper = Remapper {
            mapping: self,
            missing: BTreeSet::new(),
        };

        let mut mapped = ResourceSet::new();
        for record in set.all_records() {
            mapped.insert(remapper.record(record));
        }
        for tombstone in set.all_tombstones() {
            if let Some(tombstone) = remapper.tombstone(tombstone) {
                mapped.add_tombstone(tombstone);
            }
        }

        if remapper.missing.is_empty() {
            Ok(mapped)
        } else {
            Err(VaultError::MappingIncomplete {
                missing: remapper.missing.into_iter().collect(),
            })
        }
    }
}

struct Remapper<'a> {
    mapping: &'a AccountMapping,
    missing: BTreeSet<String>,
}

impl Remapper<'_> {
    fn lookup(&mut self, table: &str, entries: &BTreeMap<String, String>, id: &str) -> String {
        match entries.get(id) {
            Some(target) => target.clone(),
            None => {
                self.missing.insert(format!("{}:{}", table, id));
                id.to_string()
            }
        }
    }

    fn principal(&mut self, id: &str) -> String {
        let mapping = self.mapping;
        self.lookup("principal", &mapping.principals, id)
    }

    fn permission_set(&mut self, id: &str) -> String {
        let mapping = self.mapping;
        self.lookup("permission_set", &mapping.permission_sets, id)
    }

    fn account(&mut self, id: &str) -> String {
        let mapping = self.mapping;
        self.lookup("account", &mapping.accounts, id)
    }

    fn assignment(&mut self, assignment: &Assignment) -> Assignment {
        Assignment {
            principal_id: self.principal(&assignment.principal_id),
            principal_kind: assignment.principal_kind,
            permission_set_id: self.permission_set(&assignment.permission_set_id),
            account_id: self.account(&assignment.account_id),
            modified_at: assignment.modified_at,
        }
    }

    fn record(&mut self, record: &ResourceRecord) -> ResourceRecord {
        match record {
            ResourceRecord::User(user) => {
                let mut user = user.clone();
                user.id = self.principal(&user.id);
                ResourceRecord::User(user)
            }
            ResourceRecord::Group(group) => {
                let mut group = group.clone();
                group.id = self.principal(&group.id);
                group.members = group.members.iter().map(|m| self.principal(m)).collect();
                ResourceRecord::Group(group)
            }
            ResourceRecord::PermissionSet(permission_set) => {
                let mut permission_set = permission_set.clone();
                permission_set.id = self.permission_set(&permission_set.id);
                ResourceRecord::PermissionSet(permission_set)
            }
            ResourceRecord::Assignment(assignment) => {
                ResourceRecord::Assignment(self.assignment(assignment))
            }
        }
    }

    fn tombstone(&mut self, tombstone: &Tombstone) -> Option<Tombstone> {
        let last_known = tombstone.last_known.as_ref().map(|r| self.record(r));
        let id = match tombstone.resource_type {
            ResourceType::User | ResourceType::Group => self.principal(&tombstone.id),
            ResourceType::PermissionSet => self.permission_set(&tombstone.id),
            ResourceType::Assignment => match &last_known {
                Some(record) => record.id(),
                None => {
                    let Some(parsed) = Assignment::parse_id(&tombstone.id) else {
                        self.missing.insert(format!("assignment:{}", tombstone.id));
                        return None;
                    };
                    self.assignment(&parsed).id()
                }
            },
        };
        Some(Tombstone {
            resource_type: tombstone.resource_type,
            id,
            deleted_at: tombstone.deleted_at,
            last_known,
        })
    }
}
