//! Audit trail for restore mutations
//!
//! Every create, update and delete that a restore applies to the directory
//! is appended to a line-delimited JSON log with before/after state.
//!
//! - `AuditEntry`: one mutation, tagged with the restore run and snapshot.
//! - `AuditLogger`: JSONL append and read-back.
//! - `diff_values` / `diff_summary`: field-level change lists, also used for
//!   conflict reports in restore plans.

mod diff;
mod entry;
mod logger;

pub use diff::{diff_summary, diff_values};
pub use entry::{AuditEntry, Operation};
pub use logger::AuditLogger;
