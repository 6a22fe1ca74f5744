//! Object storage backend
//!
//! Keys are stored as objects in a bucket under a configurable prefix. The
//! wire client is abstracted behind [`ObjectClient`] so any S3-compatible
//! SDK can be plugged in; [`InMemoryObjectClient`] ships for tests and
//! offline dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{VaultError, VaultResult};

use super::backend::{validate_key, StorageBackend};

/// Minimal object-store capability
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> VaultResult<()>;
    async fn get_object(&self, bucket: &str, key: &str) -> VaultResult<Option<Vec<u8>>>;
    async fn head_object(&self, bucket: &str, key: &str) -> VaultResult<bool>;
    async fn delete_object(&self, bucket: &str, key: &str) -> VaultResult<()>;
    async fn list_objects(&self, bucket: &str, prefix: &str) -> VaultResult<Vec<String>>;
    async fn head_bucket(&self, bucket: &str) -> VaultResult<()>;
}

pub struct ObjectStorageBackend {
    client: Arc<dyn ObjectClient>,
    bucket: String,
    prefix: String,
}

impl ObjectStorageBackend {
    pub fn new(client: Arc<dyn ObjectClient>, bucket: impl Into<String>, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        Self {
            client,
            bucket: bucket.into(),
            prefix: if prefix.is_empty() {
                String::new()
            } else {
                format!("{}/", prefix)
            },
        }
    }

    fn object_key(&self, key: &str) -> VaultResult<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }
}

#[async_trait]
impl StorageBackend for ObjectStorageBackend {
    fn name(&self) -> &str {
        "object"
    }

    async fn put(&self, key: &str, data: &[u8]) -> VaultResult<()> {
        let object_key = self.object_key(key)?;
        self.client
            .put_object(&self.bucket, &object_key, data.to_vec())
            .await
    }

    async fn get(&self, key: &str) -> VaultResult<Option<Vec<u8>>> {
        let object_key = self.object_key(key)?;
        self.client.get_object(&self.bucket, &object_key).await
    }

    async fn exists(&self, key: &str) -> VaultResult<bool> {
        let object_key = self.object_key(key)?;
        self.client.head_object(&self.bucket, &object_key).await
    }

    async fn delete(&self, key: &str) -> VaultResult<()> {
        let object_key = self.object_key(key)?;
        self.client.delete_object(&self.bucket, &object_key).await
    }

    async fn list(&self, prefix: &str) -> VaultResult<Vec<String>> {
        let full_prefix = format!("{}{}", self.prefix, prefix);
        let mut keys: Vec<String> = self
            .client
            .list_objects(&self.bucket, &full_prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn health_check(&self) -> VaultResult<()> {
        self.client.head_bucket(&self.bucket).await
    }
}

/// Object store kept in process memory
#[derive(Default)]
pub struct InMemoryObjectClient {
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    failing_puts: AtomicU32,
    put_calls: AtomicU32,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client with the given buckets already created
    pub fn with_buckets<I, S>(buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        {
            let mut map = client.buckets.write();
            for bucket in buckets {
                map.entry(bucket.into()).or_default();
            }
        }
        client
    }

    /// Make the next `count` puts fail with a transient error
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn put_calls(&self) -> u32 {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Overwrite an object in place, bypassing any backend logic
    pub fn overwrite(&self, bucket: &str, key: &str, body: Vec<u8>) {
        if let Some(objects) = self.buckets.write().get_mut(bucket) {
            objects.insert(key.to_string(), body);
        }
    }

    fn no_such_bucket(bucket: &str) -> VaultError {
        VaultError::Storage(format!("No such bucket: {}", bucket))
    }
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> VaultResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(VaultError::TransientIo(format!(
                "SlowDown: injected failure for {}",
                key
            )));
        }
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> VaultResult<Option<Vec<u8>>> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        Ok(objects.get(key).cloned())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> VaultResult<bool> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        Ok(objects.contains_key(key))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> VaultResult<()> {
        if let Some(objects) = self.buckets.write().get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> VaultResult<Vec<String>> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn head_bucket(&self, bucket: &str) -> VaultResult<()> {
        if self.buckets.read().contains_key(bucket) {
            Ok(())
        } else {
            Err(Self::no_such_bucket(bucket))
        }
    }
}
