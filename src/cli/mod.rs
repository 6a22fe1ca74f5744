//! CLI command handlers
//!
//! This module contains the handlers for the `idvault` operator binary.
//! Directory-facing operations (backup, restore) need a live directory
//! source and are driven through the library API instead.

pub mod encrypt;
pub mod snapshot;

pub use encrypt::{handle_encrypt_command, key_provider_from_env, EncryptCommands, PASSPHRASE_ENV};
pub use snapshot::{
    handle_health, handle_prune, handle_snapshots, handle_sweep, handle_validate,
    resolve_snapshot,
};

/// Format a duration in human-readable form
pub(crate) fn format_duration(duration: chrono::Duration) -> String {
    let total_seconds = duration.num_seconds();

    if total_seconds < 60 {
        return format!("{}s", total_seconds);
    }

    let minutes = total_seconds / 60;
    if minutes < 60 {
        return format!("{}m", minutes);
    }

    let hours = minutes / 60;
    if hours < 24 {
        return format!("{}h", hours);
    }

    let days = hours / 24;
    if days < 30 {
        return format!("{}d", days);
    }

    format!("{}mo", days / 30)
}

/// Format a byte count in human-readable form
pub(crate) fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
