//! Path management for idvault
//!
//! Provides XDG-compliant path resolution for configuration, the local chunk
//! store, and the restore audit log.
//!
//! ## Path Resolution Order
//!
//! 1. `IDVAULT_DATA_DIR` environment variable (if set)
//! 2. Unix (Linux/macOS): `$XDG_CONFIG_HOME/idvault` or `~/.config/idvault`
//! 3. Windows: `%APPDATA%\idvault`

use std::path::PathBuf;

use crate::error::VaultError;

/// Environment variable that overrides the base directory
pub const DATA_DIR_ENV: &str = "IDVAULT_DATA_DIR";

/// Manages all paths used by idvault
#[derive(Debug, Clone)]
pub struct VaultPaths {
    /// Base directory for all idvault data
    base_dir: PathBuf,
}

impl VaultPaths {
    /// Create a new VaultPaths instance
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self, VaultError> {
        let base_dir = if let Ok(custom) = std::env::var(DATA_DIR_ENV) {
            PathBuf::from(custom)
        } else {
            resolve_default_path()?
        };

        Ok(Self { base_dir })
    }

    /// Create VaultPaths with a custom base directory (useful for testing)
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.config/idvault/ or equivalent)
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Default root of the filesystem backend (~/.config/idvault/store/)
    pub fn store_dir(&self) -> PathBuf {
        self.base_dir.join("store")
    }

    /// Get the path to the settings file
    pub fn settings_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the path to the restore audit log
    pub fn audit_log(&self) -> PathBuf {
        self.base_dir.join("audit.log")
    }

    /// Ensure the base and store directories exist
    pub fn ensure_directories(&self) -> Result<(), VaultError> {
        std::fs::create_dir_all(&self.base_dir)
            .map_err(|e| VaultError::Io(format!("Failed to create base directory: {}", e)))?;

        std::fs::create_dir_all(self.store_dir())
            .map_err(|e| VaultError::Io(format!("Failed to create store directory: {}", e)))?;

        Ok(())
    }

    /// Check if idvault has been initialized (config file exists)
    pub fn is_initialized(&self) -> bool {
        self.settings_file().exists()
    }
}

#[cfg(not(windows))]
fn resolve_default_path() -> Result<PathBuf, VaultError> {
    let config_base = match std::env::var("XDG_CONFIG_HOME") {
        Ok(xdg) => PathBuf::from(xdg),
        Err(_) => {
            let home = std::env::var("HOME").map_err(|_| {
                VaultError::ConfigurationInvalid("HOME environment variable not set".into())
            })?;
            PathBuf::from(home).join(".config")
        }
    };
    Ok(config_base.join("idvault"))
}

#[cfg(windows)]
fn resolve_default_path() -> Result<PathBuf, VaultError> {
    let appdata = std::env::var("APPDATA").map_err(|_| {
        VaultError::ConfigurationInvalid("Could not determine APPDATA directory".into())
    })?;
    Ok(PathBuf::from(appdata).join("idvault"))
}
