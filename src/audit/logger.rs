//! Append-only audit log
//!
//! Each entry is one JSON line. Restore execution appends one batch per
//! stage, so a crash mid-restore leaves every completed stage recorded.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{VaultError, VaultResult};
use crate::models::RestoreRunId;

use super::entry::AuditEntry;

pub struct AuditLogger {
    log_path: PathBuf,
    /// Serializes appends from concurrent restore runs in this process
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            log_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    pub fn log(&self, entry: &AuditEntry) -> VaultResult<()> {
        self.log_batch(std::slice::from_ref(entry))
    }

    /// Append entries and flush once at the end
    pub fn log_batch(&self, entries: &[AuditEntry]) -> VaultResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut lines = String::new();
        for entry in entries {
            lines.push_str(&serde_json::to_string(entry)?);
            lines.push('\n');
        }

        let _guard = self.write_lock.lock();
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| VaultError::Io(format!("Failed to open audit log: {}", e)))?;
        file.write_all(lines.as_bytes())
            .map_err(|e| VaultError::Io(format!("Failed to write audit entries: {}", e)))?;
        file.flush()
            .map_err(|e| VaultError::Io(format!("Failed to flush audit log: {}", e)))?;
        Ok(())
    }

    /// Every entry, oldest first
    pub fn read_all(&self) -> VaultResult<Vec<AuditEntry>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.log_path)
            .map_err(|e| VaultError::Io(format!("Failed to open audit log: {}", e)))?;

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
                VaultError::Json(format!(
                    "Failed to parse audit entry at line {}: {}",
                    index + 1,
                    e
                ))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Entries written by one restore run
    pub fn read_run(&self, run_id: &RestoreRunId) -> VaultResult<Vec<AuditEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| &e.run_id == run_id)
            .collect())
    }
}
