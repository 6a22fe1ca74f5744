//! Snapshot retention
//!
//! Policies select full snapshots to keep; incrementals live and die with
//! their base.

mod manager;
mod policy;

pub use manager::{
    evaluate, PruneDecision, PruneReason, RetentionManager, RetentionPlan, RetentionReport,
};
pub use policy::{RetentionPolicy, RetentionRule};
