//! Snapshot restore
//!
//! - `AccountMapping`: rewrites identifiers for cross-account restores.
//! - `build_plan` / `RestorePlan`: the dependency-ordered action list.
//! - `merge_records`: the `merge` conflict strategy.
//! - `RestoreManager`: preview and execution.

mod manager;
mod mapping;
mod merge;
mod plan;

pub use manager::{
    ActionOutcome, ActionReport, ConflictResolver, RestoreManager, RestoreOptions, RestoreResult,
    SkipReason,
};
pub use mapping::AccountMapping;
pub use merge::{merge_records, MergeOutcome};
pub use plan::{
    build_plan, stage_of, ActionKind, ConflictEntry, ConflictStrategy, PlannedAction, Resolution,
    RestorePlan, TargetLookups,
};
