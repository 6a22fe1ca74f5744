//! Merge of a snapshot record into the record present at the target
//!
//! Only set-valued attributes merge. Group membership is unioned when every
//! scalar attribute agrees; an assignment has no attributes beyond its
//! identity, so it is left as it is. Anything else needs an operator.

use crate::models::ResourceRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Write this record to the target
    Merged(ResourceRecord),
    /// The target already holds everything the snapshot has
    Unchanged,
    /// No safe automatic merge exists
    Ambiguous(String),
}

pub fn merge_records(existing: &ResourceRecord, incoming: &ResourceRecord) -> MergeOutcome {
    match (existing, incoming) {
        (ResourceRecord::Group(current), ResourceRecord::Group(snapshot)) => {
            if current.display_name != snapshot.display_name {
                return MergeOutcome::Ambiguous(format!(
                    "display name differs ({:?} at target, {:?} in snapshot)",
                    current.display_name, snapshot.display_name
                ));
            }
            if current.description != snapshot.description {
                return MergeOutcome::Ambiguous("description differs".into());
            }
            if snapshot.members.is_subset(&current.members) {
                return MergeOutcome::Unchanged;
            }
            let mut merged = current.clone();
            merged.members.extend(snapshot.members.iter().cloned());
            MergeOutcome::Merged(ResourceRecord::Group(merged))
        }
        (ResourceRecord::Assignment(_), ResourceRecord::Assignment(_)) => MergeOutcome::Unchanged,
        _ => MergeOutcome::Ambiguous(format!(
            "{} records have no mergeable attributes",
            incoming.resource_type()
        )),
    }
}
