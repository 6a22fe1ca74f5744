//! Local filesystem backend
//!
//! Keys map to files below a root directory. Writes go to a temporary file
//! in the destination directory and are renamed into place after an fsync,
//! so readers never observe a partially written chunk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{VaultError, VaultResult};

use super::backend::{validate_key, StorageBackend};

const TEMP_MARKER: &str = ".tmp-";

pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Open a backend rooted at `root`, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> VaultResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            VaultError::Storage(format!(
                "Failed to create store directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> VaultResult<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn put(&self, key: &str, data: &[u8]) -> VaultResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let suffix: u64 = rand::thread_rng().gen();
        let temp_path = path.with_file_name(format!("{}{}{:016x}", file_name, TEMP_MARKER, suffix));

        let write = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> VaultResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> VaultResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> VaultResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let key = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", rel, name)
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    // Only descend where the prefix can still match
                    let dir_prefix = format!("{}/", key);
                    if dir_prefix.starts_with(prefix) || prefix.starts_with(&dir_prefix) {
                        pending.push((entry.path(), key));
                    }
                } else if !name.contains(TEMP_MARKER) && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        debug!(prefix, count = keys.len(), "Listed filesystem keys");
        Ok(keys)
    }

    async fn health_check(&self) -> VaultResult<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(VaultError::Storage(format!(
                "Store root {} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(VaultError::Storage(format!(
                "Store root {} is unavailable: {}",
                self.root.display(),
                e
            ))),
        }
    }
}
