//! Snapshot CLI commands
//!
//! Listing, validation, pruning, backend health and orphan sweeping.

use super::{format_duration, format_size};
use crate::cancel::CancelToken;
use crate::engine::Vault;
use crate::error::{VaultError, VaultResult};
use crate::models::SnapshotId;
use crate::retention::PruneReason;
use crate::storage::SnapshotKind;

/// Resolve a snapshot argument; `latest` picks the newest snapshot
pub async fn resolve_snapshot(
    vault: &Vault,
    snapshot: &str,
    cancel: &CancelToken,
) -> VaultResult<SnapshotId> {
    if snapshot.eq_ignore_ascii_case("latest") {
        return vault
            .list_snapshots(cancel)
            .await?
            .first()
            .map(|s| s.snapshot_id)
            .ok_or_else(|| VaultError::snapshot_not_found("latest"));
    }
    SnapshotId::parse(snapshot)
        .map_err(|e| VaultError::InvalidRequest(format!("'{}' is not a snapshot id: {}", snapshot, e)))
}

pub async fn handle_snapshots(vault: &Vault, verbose: bool, cancel: &CancelToken) -> VaultResult<()> {
    let snapshots = vault.list_snapshots(cancel).await?;

    if snapshots.is_empty() {
        println!("No snapshots found.");
        return Ok(());
    }

    println!("Snapshots");
    println!("=========");
    println!();

    for (i, snapshot) in snapshots.iter().enumerate() {
        let age = chrono::Utc::now().signed_duration_since(snapshot.created_at);
        let partial = if snapshot.incomplete_types.is_empty() {
            ""
        } else {
            " [partial]"
        };

        if verbose {
            println!(
                "{}. {} ({}){}\n   Created: {}\n   Records: {}\n   Size: {}",
                i + 1,
                snapshot.snapshot_id,
                snapshot.kind,
                partial,
                snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                snapshot.records,
                format_size(snapshot.size_bytes),
            );
            if let Some(base) = snapshot.base_snapshot_id {
                println!("   Base: {}", base);
            }
            if let Some(description) = &snapshot.description {
                println!("   Description: {}", description);
            }
            println!();
        } else {
            println!(
                "  {}. {} {:<11} ({} ago, {} records){}",
                i + 1,
                snapshot.snapshot_id,
                snapshot.kind.to_string(),
                format_duration(age),
                snapshot.records,
                partial,
            );
        }
    }

    println!();
    println!("Total: {} snapshot(s)", snapshots.len());
    Ok(())
}

/// Validate one snapshot; returns whether it is intact
pub async fn handle_validate(vault: &Vault, snapshot: &str, cancel: &CancelToken) -> VaultResult<bool> {
    let snapshot_id = resolve_snapshot(vault, snapshot, cancel).await?;
    let report = vault.validate_backup(&snapshot_id, cancel).await?;

    println!("{}", report.summary());
    for issue in &report.issues {
        println!("  - {}", issue);
    }
    Ok(report.is_valid())
}

pub async fn handle_prune(vault: &Vault, dry_run: bool, cancel: &CancelToken) -> VaultResult<()> {
    let policy = &vault.settings().retention;
    let rules: Vec<String> = policy.rules.iter().map(|r| r.to_string()).collect();
    println!("Retention policy: {}", rules.join(", "));

    if dry_run {
        let plan = vault.plan_retention(policy, cancel).await?;
        if plan.is_noop() {
            println!("Nothing to prune; {} snapshot(s) retained.", plan.retained.len());
            return Ok(());
        }
        println!("Would prune {} snapshot(s):", plan.pruned.len());
        for decision in &plan.pruned {
            let reason = match &decision.reason {
                PruneReason::OutsidePolicy => "outside every rule".to_string(),
                PruneReason::BasePruned { base } => format!("base {} is pruned", base),
                PruneReason::BaseMissing { base: Some(base) } => format!("base {} is missing", base),
                PruneReason::BaseMissing { base: None } => "no base recorded".to_string(),
            };
            let kind = match decision.kind {
                SnapshotKind::Full => "full",
                SnapshotKind::Incremental => "incremental",
            };
            println!(
                "  {} {:<11} {} ({})",
                decision.snapshot_id,
                kind,
                decision.created_at.format("%Y-%m-%d %H:%M"),
                reason
            );
        }
        return Ok(());
    }

    let report = vault.enforce_retention(policy, cancel).await?;
    println!("{}", report.summary());
    Ok(())
}

pub async fn handle_health(vault: &Vault) -> bool {
    let report = vault.health_check().await;
    println!("{}", report.summary());
    report.reachable
}

pub async fn handle_sweep(vault: &Vault, cancel: &CancelToken) -> VaultResult<()> {
    let removed = vault.discard_partial_chunks(cancel).await?;
    println!("Removed {} orphaned chunk(s).", removed);
    Ok(())
}
