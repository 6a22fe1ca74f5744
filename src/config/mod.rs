//! Configuration module for idvault
//!
//! This module provides configuration management including:
//! - XDG-compliant path resolution
//! - Engine settings persistence and validation

pub mod paths;
pub mod settings;

pub use paths::VaultPaths;
pub use settings::Settings;
