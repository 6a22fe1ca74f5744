//! Strongly-typed ID wrappers for engine-issued identifiers
//!
//! Directory identifiers are opaque strings owned by the directory; the ids
//! here are the ones idvault mints itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Macro to generate ID newtype wrappers
macro_rules! define_id {
    ($name:ident, $display_prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Parse an ID from a string, with or without the display prefix
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                s.parse()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $display_prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix($display_prefix).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

define_id!(SnapshotId, "snap-");
define_id!(RestoreRunId, "run-");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_round_trips() {
        let id = SnapshotId::new();
        let display = id.to_string();
        assert!(display.starts_with("snap-"));
        assert_eq!(SnapshotId::parse(&display).unwrap(), id);
    }

    #[test]
    fn test_id_parse_without_prefix() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id = SnapshotId::parse(uuid_str).unwrap();
        assert_eq!(id.as_uuid().to_string(), uuid_str);
    }

    #[test]
    fn test_id_serialization_is_bare_uuid() {
        let id = RestoreRunId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let deserialized: RestoreRunId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_invalid_id_rejected() {
        assert!(SnapshotId::parse("snap-not-a-uuid").is_err());
    }
}
