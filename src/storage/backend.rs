//! Storage backend abstraction
//!
//! A backend is a flat key/value blob store. Keys are `/`-separated relative
//! paths such as `chunks/ab/ab12...` or `manifests/<id>.json`.

use async_trait::async_trait;

use crate::error::{VaultError, VaultResult};

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name for logs ("filesystem", "object")
    fn name(&self) -> &str;

    /// Store bytes under a key, replacing any previous value
    async fn put(&self, key: &str, data: &[u8]) -> VaultResult<()>;

    /// Fetch bytes; `None` when the key does not exist
    async fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>>;

    async fn exists(&self, key: &str) -> VaultResult<bool>;

    /// Remove a key; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> VaultResult<()>;

    /// All keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> VaultResult<Vec<String>>;

    /// Cheap reachability check with no side effects
    async fn health_check(&self) -> VaultResult<()>;
}

/// Reject keys that could escape the backend root
pub(crate) fn validate_key(key: &str) -> VaultResult<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(VaultError::InvalidRequest(format!(
            "Invalid storage key: {:?}",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("chunks/ab/abcdef").is_ok());
        assert!(validate_key("manifests/x.json").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("chunks/../../etc").is_err());
        assert!(validate_key("chunks//x").is_err());
    }
}
