//! Directory resource records
//!
//! Users, groups, permission sets and account assignments as collected from
//! the directory. Identifiers are opaque strings owned by the directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The four kinds of directory resources, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    User,
    Group,
    PermissionSet,
    Assignment,
}

impl ResourceType {
    /// Every resource type, in restore stage order
    pub const ALL: [ResourceType; 4] = [
        ResourceType::User,
        ResourceType::Group,
        ResourceType::PermissionSet,
        ResourceType::Assignment,
    ];

    /// Dependency rank: principals, then permission sets, then assignments
    pub fn tier(&self) -> u8 {
        match self {
            Self::User | Self::Group => 0,
            Self::PermissionSet => 1,
            Self::Assignment => 2,
        }
    }

    /// Types whose records must exist before records of this type can
    pub fn dependencies(&self) -> &'static [ResourceType] {
        match self {
            Self::Assignment => &[Self::User, Self::Group, Self::PermissionSet],
            _ => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::PermissionSet => "permission_set",
            Self::Assignment => "assignment",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "user" | "users" => Ok(Self::User),
            "group" | "groups" => Ok(Self::Group),
            "permission_set" | "permission_sets" => Ok(Self::PermissionSet),
            "assignment" | "assignments" => Ok(Self::Assignment),
            other => Err(format!("unknown resource type: {}", other)),
        }
    }
}

/// Whether an assignment targets a user or a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Group,
}

impl PrincipalKind {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::User => ResourceType::User,
            Self::Group => ResourceType::Group,
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Identity of a resource within the directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// A directory user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub user_name: String,
    pub display_name: String,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl User {
    pub fn new(
        id: impl Into<String>,
        user_name: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_name: user_name.into(),
            display_name: display_name.into(),
            emails: Vec::new(),
            active: true,
            modified_at: None,
        }
    }
}

/// A directory group with its member user ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub members: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            description: None,
            members: BTreeSet::new(),
            modified_at: None,
        }
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }
}

/// A permission set (identified by its ARN)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// ISO-8601 duration, e.g. `PT8H`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_duration: Option<String>,
    #[serde(default)]
    pub managed_policies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl PermissionSet {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            session_duration: None,
            managed_policies: BTreeSet::new(),
            inline_policy: None,
            modified_at: None,
        }
    }
}

/// Grants a principal a permission set in one target account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub principal_id: String,
    pub principal_kind: PrincipalKind,
    pub permission_set_id: String,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn new(
        principal_kind: PrincipalKind,
        principal_id: impl Into<String>,
        permission_set_id: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            principal_id: principal_id.into(),
            principal_kind,
            permission_set_id: permission_set_id.into(),
            account_id: account_id.into(),
            modified_at: None,
        }
    }

    /// Composite identity: `<account>:<permission set>:<kind>:<principal>`
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.account_id, self.permission_set_id, self.principal_kind, self.principal_id
        )
    }

    /// Split a composite assignment id back into its references.
    ///
    /// Permission set ARNs contain colons, account and principal ids do not,
    /// so the account is taken from the left and the principal from the right.
    pub fn parse_id(id: &str) -> Option<Assignment> {
        let (account_id, rest) = id.split_once(':')?;
        let (rest, principal_id) = rest.rsplit_once(':')?;
        let (permission_set_id, kind) = rest.rsplit_once(':')?;
        let principal_kind = match kind {
            "user" => PrincipalKind::User,
            "group" => PrincipalKind::Group,
            _ => return None,
        };
        if account_id.is_empty() || permission_set_id.is_empty() || principal_id.is_empty() {
            return None;
        }
        Some(Assignment::new(
            principal_kind,
            principal_id,
            permission_set_id,
            account_id,
        ))
    }
}

/// A typed directory record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceRecord {
    User(User),
    Group(Group),
    PermissionSet(PermissionSet),
    Assignment(Assignment),
}

impl ResourceRecord {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::User(_) => ResourceType::User,
            Self::Group(_) => ResourceType::Group,
            Self::PermissionSet(_) => ResourceType::PermissionSet,
            Self::Assignment(_) => ResourceType::Assignment,
        }
    }

    /// Stable source identifier
    pub fn id(&self) -> String {
        match self {
            Self::User(u) => u.id.clone(),
            Self::Group(g) => g.id.clone(),
            Self::PermissionSet(p) => p.id.clone(),
            Self::Assignment(a) => a.id(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type(), self.id())
    }

    /// Human-readable label for logs and audit entries
    pub fn label(&self) -> String {
        match self {
            Self::User(u) => u.user_name.clone(),
            Self::Group(g) => g.display_name.clone(),
            Self::PermissionSet(p) => p.name.clone(),
            Self::Assignment(a) => format!(
                "{} {} -> {} in {}",
                a.principal_kind, a.principal_id, a.permission_set_id, a.account_id
            ),
        }
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::User(u) => u.modified_at,
            Self::Group(g) => g.modified_at,
            Self::PermissionSet(p) => p.modified_at,
            Self::Assignment(a) => a.modified_at,
        }
    }

    pub fn set_modified_at(&mut self, at: Option<DateTime<Utc>>) {
        match self {
            Self::User(u) => u.modified_at = at,
            Self::Group(g) => g.modified_at = at,
            Self::PermissionSet(p) => p.modified_at = at,
            Self::Assignment(a) => a.modified_at = at,
        }
    }

    /// Hard references that must resolve before this record can be applied
    pub fn references(&self) -> Vec<ResourceKey> {
        match self {
            Self::Assignment(a) => vec![
                ResourceKey::new(a.principal_kind.resource_type(), a.principal_id.clone()),
                ResourceKey::new(ResourceType::PermissionSet, a.permission_set_id.clone()),
            ],
            _ => Vec::new(),
        }
    }

    /// Equality ignoring source-reported modification times
    pub fn same_state(&self, other: &ResourceRecord) -> bool {
        let mut left = self.clone();
        let mut right = other.clone();
        left.set_modified_at(None);
        right.set_modified_at(None);
        left == right
    }

    /// JSON view without the timestamp, used for field-level diffs
    pub fn comparable_json(&self) -> serde_json::Value {
        let mut copy = self.clone();
        copy.set_modified_at(None);
        serde_json::to_value(&copy).unwrap_or(serde_json::Value::Null)
    }
}

impl From<User> for ResourceRecord {
    fn from(user: User) -> Self {
        Self::User(user)
    }
}

impl From<Group> for ResourceRecord {
    fn from(group: Group) -> Self {
        Self::Group(group)
    }
}

impl From<PermissionSet> for ResourceRecord {
    fn from(permission_set: PermissionSet) -> Self {
        Self::PermissionSet(permission_set)
    }
}

impl From<Assignment> for ResourceRecord {
    fn from(assignment: Assignment) -> Self {
        Self::Assignment(assignment)
    }
}

/// Marker for a resource deleted since the parent snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub resource_type: ResourceType,
    pub id: String,
    pub deleted_at: DateTime<Utc>,
    /// State recorded by the parent snapshot, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known: Option<ResourceRecord>,
}

impl Tombstone {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type, self.id.clone())
    }
}
