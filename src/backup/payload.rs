//! Per-type snapshot payloads
//!
//! Each resource type of a snapshot is serialized as one JSON document
//! holding its records and tombstones. The document is what gets chunked.

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::models::{ResourceRecord, ResourceSet, ResourceType, Tombstone};

pub const PAYLOAD_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypePayload {
    pub format_version: u32,
    pub resource_type: ResourceType,
    /// Records are the complete population of the type, not a delta
    pub full_listing: bool,
    pub records: Vec<ResourceRecord>,
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
}

impl TypePayload {
    /// Extract one type from a collected set
    pub fn from_set(set: &ResourceSet, resource_type: ResourceType, full_listing: bool) -> Self {
        Self {
            format_version: PAYLOAD_FORMAT_VERSION,
            resource_type,
            full_listing,
            records: set.records(resource_type).cloned().collect(),
            tombstones: if full_listing {
                Vec::new()
            } else {
                set.tombstones(resource_type).cloned().collect()
            },
        }
    }

    pub fn encode(&self) -> VaultResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a reassembled payload; anything malformed is corruption
    pub fn decode(expected: ResourceType, bytes: &[u8]) -> VaultResult<Self> {
        let item = format!("{} payload", expected);
        let payload: TypePayload = serde_json::from_slice(bytes)
            .map_err(|e| VaultError::corruption(item.clone(), e.to_string()))?;

        if payload.format_version > PAYLOAD_FORMAT_VERSION {
            return Err(VaultError::corruption(
                item,
                format!("unsupported payload format {}", payload.format_version),
            ));
        }
        if payload.resource_type != expected
            || payload.records.iter().any(|r| r.resource_type() != expected)
            || payload.tombstones.iter().any(|t| t.resource_type != expected)
        {
            return Err(VaultError::corruption(item, "payload holds the wrong resource type"));
        }
        Ok(payload)
    }

    /// Apply this payload onto accumulated state
    pub fn apply_to(self, state: &mut ResourceSet) {
        if self.full_listing {
            state.replace_type(self.resource_type, self.records);
        } else {
            let mut delta = ResourceSet::from_records(self.records);
            for tombstone in self.tombstones {
                delta.add_tombstone(tombstone);
            }
            state.apply_incremental(&delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResourceKey, User};
    use chrono::Utc;

    fn user(id: &str) -> ResourceRecord {
        User::new(id, id, id).into()
    }

    #[test]
    fn test_decode_rejects_mismatched_type() {
        let payload = TypePayload::from_set(
            &ResourceSet::from_records([user("u1")]),
            ResourceType::User,
            true,
        );
        let bytes = payload.encode().unwrap();

        assert_eq!(TypePayload::decode(ResourceType::User, &bytes).unwrap(), payload);
        assert!(TypePayload::decode(ResourceType::Group, &bytes)
            .unwrap_err()
            .is_corruption());
        assert!(TypePayload::decode(ResourceType::User, b"[1,2")
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn test_full_listing_replaces_and_delta_merges() {
        let mut state = ResourceSet::from_records([user("u1"), user("u2")]);

        let mut delta = ResourceSet::from_records([user("u3")]);
        delta.add_tombstone(Tombstone {
            resource_type: ResourceType::User,
            id: "u1".into(),
            deleted_at: Utc::now(),
            last_known: None,
        });
        TypePayload::from_set(&delta, ResourceType::User, false).apply_to(&mut state);
        assert_eq!(
            state.ids(ResourceType::User).into_iter().collect::<Vec<_>>(),
            vec!["u2", "u3"]
        );
        assert!(state
            .tombstones(ResourceType::User)
            .any(|t| t.key() == ResourceKey::new(ResourceType::User, "u1")));

        let full = ResourceSet::from_records([user("u9")]);
        TypePayload::from_set(&full, ResourceType::User, true).apply_to(&mut state);
        assert_eq!(state.record_count(ResourceType::User), 1);
        assert_eq!(state.tombstone_count(ResourceType::User), 0);
    }
}
