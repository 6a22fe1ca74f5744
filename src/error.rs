//! Custom error types for idvault
//!
//! This module defines the error hierarchy for the backup engine using thiserror
//! for ergonomic error definitions. The first group of variants is the
//! operational taxonomy reported by backup, restore and retention runs; the
//! rest are plumbing errors raised by configuration and storage code.

use thiserror::Error;

/// The main error type for idvault operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Retryable I/O failure (network hiccup, throttling, busy backend)
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// A remote call did not finish within its deadline
    #[error("Operation timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// Stored bytes failed integrity verification
    #[error("Corruption detected in {item}: {reason}")]
    Corruption { item: String, reason: String },

    /// A conflict could not be resolved with the requested strategy
    #[error("Conflict unresolved for {resource}: {reason}")]
    ConflictUnresolved { resource: String, reason: String },

    /// The account mapping does not cover every referenced identifier
    #[error("Account mapping incomplete: {} unmapped id(s): {}", missing.len(), missing.join(", "))]
    MappingIncomplete { missing: Vec<String> },

    /// A resource references something that is neither planned nor present
    #[error("Dependency unsatisfied for {resource}: {reason}")]
    DependencyUnsatisfied { resource: String, reason: String },

    /// Settings or policies that cannot be acted upon
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),

    /// Entity not found errors
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    /// Encryption errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Storage backend errors that are not worth retrying
    #[error("Storage error: {0}")]
    Storage(String),

    /// Directory source rejected a request
    #[error("Directory error: {0}")]
    Directory(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The caller asked for something that makes no sense
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl VaultError {
    /// Create a "not found" error for snapshots
    pub fn snapshot_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Snapshot",
            identifier: identifier.into(),
        }
    }

    /// Create a "not found" error for chunks
    pub fn chunk_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Chunk",
            identifier: identifier.into(),
        }
    }

    /// Create a "not found" error for directory resources
    pub fn resource_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Resource",
            identifier: identifier.into(),
        }
    }

    /// Create a corruption error
    pub fn corruption(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corruption {
            item: item.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is an integrity failure
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Check if retrying the failed call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Timeout { .. })
    }
}

// Implement From traits for common error types

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                Self::TransientIo(err.to_string())
            }
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias for idvault operations
pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VaultError::ConfigurationInvalid("chunk size is zero".into());
        assert_eq!(err.to_string(), "Invalid configuration: chunk size is zero");
    }

    #[test]
    fn test_not_found_error() {
        let err = VaultError::snapshot_not_found("snap-1234");
        assert_eq!(err.to_string(), "Snapshot not found: snap-1234");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_mapping_incomplete_lists_every_id() {
        let err = VaultError::MappingIncomplete {
            missing: vec!["u-1".into(), "acct-2".into()],
        };
        assert_eq!(
            err.to_string(),
            "Account mapping incomplete: 2 unmapped id(s): u-1, acct-2"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(VaultError::TransientIo("throttled".into()).is_retryable());
        assert!(VaultError::Timeout {
            operation: "list".into(),
            millis: 10
        }
        .is_retryable());
        assert!(!VaultError::corruption("chunk", "hash mismatch").is_retryable());
        assert!(!VaultError::Cancelled.is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let vault_err: VaultError = io_err.into();
        assert!(matches!(vault_err, VaultError::Io(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        let vault_err: VaultError = io_err.into();
        assert!(vault_err.is_retryable());
    }
}
