//! Content-addressed chunk store
//!
//! `StorageEngine` turns payloads into fixed-size chunks, deduplicates them
//! by plaintext hash, compresses and encrypts what it writes, and verifies
//! every byte it reads back. It also owns manifest persistence and chunk
//! garbage collection, since both need a view over every manifest.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::crypto::encryption::{open, seal_with, EnvelopeHeader};
use crate::crypto::KeyProvider;
use crate::error::{VaultError, VaultResult};
use crate::models::SnapshotId;
use crate::retry::{retry, RetryPolicy};

use super::backend::StorageBackend;
use super::chunk::{ChunkFrame, ChunkHash, ChunkRef, StoredPayload, CHUNK_PREFIX};
use super::compression::{compress, decompress};
use super::manifest::{Manifest, MANIFEST_PREFIX};

/// Write-path options, resolved once from settings
#[derive(Debug, Clone)]
pub struct ChunkStoreOptions {
    pub chunk_size: usize,
    /// zstd level, `None` to store bodies uncompressed
    pub compression_level: Option<i32>,
    pub encrypt: bool,
    /// Concurrent chunk reads/writes per payload
    pub workers: usize,
}

impl Default for ChunkStoreOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            compression_level: Some(3),
            encrypt: false,
            workers: 4,
        }
    }
}

/// Counters since the engine was opened
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub chunks_written: u64,
    pub dedup_hits: u64,
    /// Bytes handed to the backend, after compression and encryption
    pub bytes_written: u64,
    pub chunks_deleted: u64,
}

/// Manifests that could be read, plus keys that could not
struct ManifestScan {
    manifests: Vec<Manifest>,
    unreadable: Vec<(String, VaultError)>,
}

pub struct StorageEngine {
    backend: Arc<dyn StorageBackend>,
    options: ChunkStoreOptions,
    keys: Option<Arc<dyn KeyProvider>>,
    retry: RetryPolicy,
    stats: Mutex<StoreStats>,
}

impl StorageEngine {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        options: ChunkStoreOptions,
        keys: Option<Arc<dyn KeyProvider>>,
        retry: RetryPolicy,
    ) -> VaultResult<Self> {
        if options.chunk_size == 0 {
            return Err(VaultError::ConfigurationInvalid(
                "chunk size must be non-zero".into(),
            ));
        }
        if options.encrypt && keys.is_none() {
            return Err(VaultError::ConfigurationInvalid(
                "encryption is enabled but no key provider is configured".into(),
            ));
        }
        Ok(Self {
            backend,
            options,
            keys,
            retry,
            stats: Mutex::new(StoreStats::default()),
        })
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn options(&self) -> &ChunkStoreOptions {
        &self.options
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    /// Chunk, deduplicate and persist a payload
    pub async fn write(&self, data: &[u8], cancel: &CancelToken) -> VaultResult<StoredPayload> {
        let content_hash = ChunkHash::of(data);
        let chunks: Vec<ChunkRef> = stream::iter(data.chunks(self.options.chunk_size))
            .map(|piece| self.write_chunk(piece, cancel))
            .buffered(self.options.workers.max(1))
            .try_collect()
            .await?;

        debug!(
            payload = %content_hash,
            size = data.len(),
            chunks = chunks.len(),
            "Stored payload"
        );

        Ok(StoredPayload {
            content_hash,
            size: data.len() as u64,
            chunks,
        })
    }

    async fn write_chunk(&self, piece: &[u8], cancel: &CancelToken) -> VaultResult<ChunkRef> {
        let hash = ChunkHash::of(piece);
        let key = hash.storage_key();

        let existing = retry(&self.retry, "chunk lookup", cancel, || self.backend.get(&key)).await?;
        if let Some(bytes) = existing {
            // Only a chunk that decodes back to this exact piece may be reused
            match self.decode_chunk(&hash, &bytes) {
                Ok(_) => {
                    let frame = ChunkFrame::decode(&hash, &bytes)?;
                    self.stats.lock().dedup_hits += 1;
                    debug!(chunk = %hash, "Dedup hit");
                    return Ok(ChunkRef {
                        content_hash: hash,
                        size: piece.len() as u64,
                        compressed: frame.compressed,
                        encrypted: frame.encrypted,
                    });
                }
                Err(e) if e.is_corruption() => {
                    warn!(chunk = %hash, error = %e, "Existing chunk is damaged, rewriting")
                }
                Err(e) => return Err(e),
            }
        }

        let mut body = piece.to_vec();
        let mut compressed = false;
        if let Some(level) = self.options.compression_level {
            let packed = compress(piece, level)?;
            if packed.len() < piece.len() {
                body = packed;
                compressed = true;
            }
        }

        let mut encrypted = false;
        if self.options.encrypt {
            let keys = self.key_provider()?;
            body = seal_with(&body, keys.as_ref())?;
            encrypted = true;
        }

        let frame = ChunkFrame {
            compressed,
            encrypted,
            plaintext_len: piece.len() as u64,
            body,
        }
        .encode();

        retry(&self.retry, "chunk write", cancel, || {
            self.backend.put(&key, &frame)
        })
        .await?;

        {
            let mut stats = self.stats.lock();
            stats.chunks_written += 1;
            stats.bytes_written += frame.len() as u64;
        }

        Ok(ChunkRef {
            content_hash: hash,
            size: piece.len() as u64,
            compressed,
            encrypted,
        })
    }

    fn key_provider(&self) -> VaultResult<&Arc<dyn KeyProvider>> {
        self.keys.as_ref().ok_or_else(|| {
            VaultError::Encryption("chunk is encrypted but no key provider is configured".into())
        })
    }

    /// Fetch one chunk and verify it against its hash
    pub async fn read_chunk(&self, hash: &ChunkHash, cancel: &CancelToken) -> VaultResult<Vec<u8>> {
        let key = hash.storage_key();
        let bytes = retry(&self.retry, "chunk read", cancel, || self.backend.get(&key))
            .await?
            .ok_or_else(|| VaultError::chunk_not_found(hash.to_hex()))?;
        self.decode_chunk(hash, &bytes)
    }

    fn decode_chunk(&self, hash: &ChunkHash, bytes: &[u8]) -> VaultResult<Vec<u8>> {
        let frame = ChunkFrame::decode(hash, bytes)?;
        let mut body = frame.body;

        if frame.encrypted {
            let keys = self.key_provider()?;
            let header = EnvelopeHeader::parse(&body)
                .map_err(|e| VaultError::corruption(hash.to_hex(), e.to_string()))?;
            // An unknown key version is a configuration problem, not damage
            keys.get_key(header.key_version)?;
            body = open(&body, keys.as_ref())
                .map_err(|e| VaultError::corruption(hash.to_hex(), e.to_string()))?;
        }

        if frame.compressed {
            body = decompress(&body)
                .map_err(|e| VaultError::corruption(hash.to_hex(), e.to_string()))?;
        }

        if body.len() as u64 != frame.plaintext_len {
            return Err(VaultError::corruption(
                hash.to_hex(),
                format!(
                    "length mismatch: header says {}, got {}",
                    frame.plaintext_len,
                    body.len()
                ),
            ));
        }

        if ChunkHash::of(&body) != *hash {
            return Err(VaultError::corruption(hash.to_hex(), "content hash mismatch"));
        }

        Ok(body)
    }

    /// Reassemble a payload from its chunks and verify the whole-payload hash
    pub async fn read_payload(
        &self,
        chunks: &[ChunkRef],
        expected: &ChunkHash,
        cancel: &CancelToken,
    ) -> VaultResult<Vec<u8>> {
        let pieces: Vec<Vec<u8>> = stream::iter(chunks)
            .map(|chunk| self.read_chunk(&chunk.content_hash, cancel))
            .buffered(self.options.workers.max(1))
            .try_collect()
            .await?;

        let payload = pieces.concat();
        if ChunkHash::of(&payload) != *expected {
            return Err(VaultError::corruption(
                format!("payload {}", expected),
                "reassembled payload hash mismatch",
            ));
        }
        Ok(payload)
    }

    pub async fn put_manifest(&self, manifest: &Manifest, cancel: &CancelToken) -> VaultResult<()> {
        let key = Manifest::storage_key(&manifest.snapshot_id);
        let bytes = serde_json::to_vec_pretty(manifest)?;
        retry(&self.retry, "manifest write", cancel, || {
            self.backend.put(&key, &bytes)
        })
        .await
    }

    /// Load a manifest; unparseable documents are reported as corruption
    pub async fn get_manifest(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<Manifest> {
        let key = Manifest::storage_key(snapshot_id);
        let bytes = retry(&self.retry, "manifest read", cancel, || self.backend.get(&key))
            .await?
            .ok_or_else(|| VaultError::snapshot_not_found(snapshot_id.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::corruption(format!("manifest {}", snapshot_id), e.to_string()))
    }

    pub async fn delete_manifest(
        &self,
        snapshot_id: &SnapshotId,
        cancel: &CancelToken,
    ) -> VaultResult<()> {
        let key = Manifest::storage_key(snapshot_id);
        retry(&self.retry, "manifest delete", cancel, || {
            self.backend.delete(&key)
        })
        .await
    }

    async fn scan_manifests(&self, cancel: &CancelToken) -> VaultResult<ManifestScan> {
        let keys = retry(&self.retry, "manifest list", cancel, || {
            self.backend.list(MANIFEST_PREFIX)
        })
        .await?;

        let mut manifests = Vec::new();
        let mut unreadable = Vec::new();
        for key in keys {
            let fetched = retry(&self.retry, "manifest read", cancel, || self.backend.get(&key)).await;
            match fetched {
                Ok(Some(bytes)) => match serde_json::from_slice::<Manifest>(&bytes) {
                    Ok(manifest) => manifests.push(manifest),
                    Err(e) => unreadable.push((key, VaultError::corruption("manifest", e.to_string()))),
                },
                // Deleted between list and get
                Ok(None) => {}
                Err(VaultError::Cancelled) => return Err(VaultError::Cancelled),
                Err(e) => unreadable.push((key, e)),
            }
        }

        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(ManifestScan {
            manifests,
            unreadable,
        })
    }

    /// Every readable manifest, newest first; unreadable ones are logged and skipped
    pub async fn list_manifests(&self, cancel: &CancelToken) -> VaultResult<Vec<Manifest>> {
        let scan = self.scan_manifests(cancel).await?;
        for (key, err) in &scan.unreadable {
            warn!("Skipping unreadable manifest {}: {}", key, err);
        }
        Ok(scan.manifests)
    }

    /// Every manifest, newest first, or an error naming the first one that
    /// cannot be read.
    ///
    /// Anything that deletes must decide on this view: a skipped manifest
    /// would look like a missing base or an unreferenced chunk.
    pub async fn list_manifests_complete(&self, cancel: &CancelToken) -> VaultResult<Vec<Manifest>> {
        let scan = self.scan_manifests(cancel).await?;
        if let Some((key, err)) = scan.unreadable.into_iter().next() {
            return Err(VaultError::Storage(format!(
                "Refusing to delete, manifest {} is unreadable: {}",
                key, err
            )));
        }
        Ok(scan.manifests)
    }

    /// Chunks referenced by any manifest; fails when a manifest cannot be read
    pub async fn referenced_chunks(&self, cancel: &CancelToken) -> VaultResult<HashSet<ChunkHash>> {
        Ok(self
            .list_manifests_complete(cancel)
            .await?
            .iter()
            .flat_map(|m| m.chunk_hashes().copied())
            .collect())
    }

    /// Delete a chunk if no remaining manifest references it
    pub async fn delete_if_unreferenced(
        &self,
        hash: &ChunkHash,
        cancel: &CancelToken,
    ) -> VaultResult<bool> {
        Ok(self.collect_garbage([*hash], cancel).await? == 1)
    }

    /// Batch form of [`StorageEngine::delete_if_unreferenced`]; returns how many were deleted
    pub async fn collect_garbage<I>(&self, candidates: I, cancel: &CancelToken) -> VaultResult<usize>
    where
        I: IntoIterator<Item = ChunkHash>,
    {
        let referenced = self.referenced_chunks(cancel).await?;
        let doomed: HashSet<ChunkHash> = candidates
            .into_iter()
            .filter(|hash| !referenced.contains(hash))
            .collect();
        self.delete_chunks(doomed, cancel).await
    }

    /// Remove chunks that no manifest references at all.
    ///
    /// Leftovers of cancelled or failed backups end up here. Must not run
    /// while a backup is writing, as its chunks are not referenced yet.
    pub async fn sweep_orphans(&self, cancel: &CancelToken) -> VaultResult<usize> {
        let referenced = self.referenced_chunks(cancel).await?;
        let orphans: HashSet<ChunkHash> = self
            .list_chunks(cancel)
            .await?
            .into_iter()
            .filter(|hash| !referenced.contains(hash))
            .collect();
        let deleted = self.delete_chunks(orphans, cancel).await?;
        if deleted > 0 {
            info!(deleted, "Swept orphaned chunks");
        }
        Ok(deleted)
    }

    async fn delete_chunks(&self, hashes: HashSet<ChunkHash>, cancel: &CancelToken) -> VaultResult<usize> {
        let mut deleted = 0;
        for hash in hashes {
            let key = hash.storage_key();
            if !retry(&self.retry, "chunk exists", cancel, || self.backend.exists(&key)).await? {
                continue;
            }
            retry(&self.retry, "chunk delete", cancel, || self.backend.delete(&key)).await?;
            debug!(chunk = %hash, "Deleted unreferenced chunk");
            deleted += 1;
        }
        self.stats.lock().chunks_deleted += deleted as u64;
        Ok(deleted)
    }

    pub async fn list_chunks(&self, cancel: &CancelToken) -> VaultResult<Vec<ChunkHash>> {
        let keys = retry(&self.retry, "chunk list", cancel, || {
            self.backend.list(CHUNK_PREFIX)
        })
        .await?;
        Ok(keys
            .iter()
            .filter_map(|key| ChunkHash::from_storage_key(key))
            .collect())
    }

    pub async fn chunk_count(&self, cancel: &CancelToken) -> VaultResult<usize> {
        Ok(self.list_chunks(cancel).await?.len())
    }

    /// Backend reachability check, bounded by the remote-call timeout
    pub async fn health_check(&self) -> VaultResult<()> {
        match tokio::time::timeout(self.retry.timeout, self.backend.health_check()).await {
            Ok(result) => result,
            Err(_) => Err(VaultError::Timeout {
                operation: format!("{} health check", self.backend.name()),
                millis: self.retry.timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_provider::{KeyMaterial, StaticKeyProvider, KEY_LEN};
    use crate::storage::filesystem::FilesystemBackend;
    use crate::storage::manifest::SnapshotKind;
    use crate::models::ResourceType;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn create_test_engine(options: ChunkStoreOptions) -> (StorageEngine, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::open(temp_dir.path().join("store"))
            .await
            .unwrap();
        let keys: Arc<dyn KeyProvider> =
            Arc::new(StaticKeyProvider::new(1, KeyMaterial::new([3u8; KEY_LEN])));
        let engine = StorageEngine::new(
            Arc::new(backend),
            options,
            Some(keys),
            RetryPolicy::immediate(3),
        )
        .unwrap();
        (engine, temp_dir)
    }

    fn small_chunks() -> ChunkStoreOptions {
        ChunkStoreOptions {
            chunk_size: 16,
            ..ChunkStoreOptions::default()
        }
    }

    fn payload() -> Vec<u8> {
        (0..100u8).collect()
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (engine, _temp) = create_test_engine(small_chunks()).await;
        let cancel = CancelToken::new();
        let data = payload();

        let stored = engine.write(&data, &cancel).await.unwrap();
        assert_eq!(stored.size, 100);
        assert_eq!(stored.chunks.len(), 7);
        assert_eq!(stored.content_hash, ChunkHash::of(&data));

        let back = engine
            .read_payload(&stored.chunks, &stored.content_hash, &cancel)
            .await
            .unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_dedup_does_not_grow_store() {
        let (engine, _temp) = create_test_engine(small_chunks()).await;
        let cancel = CancelToken::new();
        let data = payload();

        let first = engine.write(&data, &cancel).await.unwrap();
        let count = engine.chunk_count(&cancel).await.unwrap();
        let second = engine.write(&data, &cancel).await.unwrap();

        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.chunks, second.chunks);
        assert_eq!(engine.chunk_count(&cancel).await.unwrap(), count);
        assert_eq!(engine.stats().dedup_hits, 7);
    }

    #[tokio::test]
    async fn test_compression_and_encryption_flags() {
        let options = ChunkStoreOptions {
            encrypt: true,
            ..ChunkStoreOptions::default()
        };
        let (engine, _temp) = create_test_engine(options).await;
        let cancel = CancelToken::new();
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(8);

        let stored = engine.write(&data, &cancel).await.unwrap();
        assert_eq!(stored.chunks.len(), 1);
        assert!(stored.chunks[0].compressed);
        assert!(stored.chunks[0].encrypted);

        let raw = engine
            .backend()
            .get(&stored.chunks[0].content_hash.storage_key())
            .await
            .unwrap()
            .unwrap();
        assert!(!raw.windows(16).any(|w| w == &data[..16]));
        assert_eq!(
            engine.read_chunk(&stored.chunks[0].content_hash, &cancel).await.unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn test_incompressible_chunk_stored_raw() {
        let options = ChunkStoreOptions {
            chunk_size: 8,
            ..ChunkStoreOptions::default()
        };
        let (engine, _temp) = create_test_engine(options).await;
        let stored = engine.write(b"\x01\x7f\x33\x90", &CancelToken::new()).await.unwrap();
        assert!(!stored.chunks[0].compressed);
    }

    #[tokio::test]
    async fn test_flipped_byte_is_corruption() {
        let options = ChunkStoreOptions {
            compression_level: None,
            ..small_chunks()
        };
        let (engine, _temp) = create_test_engine(options).await;
        let cancel = CancelToken::new();
        let stored = engine.write(&payload(), &cancel).await.unwrap();

        let target = stored.chunks[2].content_hash;
        let key = target.storage_key();
        let mut raw = engine.backend().get(&key).await.unwrap().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        engine.backend().put(&key, &raw).await.unwrap();

        let err = engine.read_chunk(&target, &cancel).await.unwrap_err();
        assert!(err.is_corruption());
        let err = engine
            .read_payload(&stored.chunks, &stored.content_hash, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_rewrite_heals_damaged_chunk() {
        let options = ChunkStoreOptions {
            compression_level: None,
            ..small_chunks()
        };
        let (engine, _temp) = create_test_engine(options).await;
        let cancel = CancelToken::new();
        let data = payload();
        let stored = engine.write(&data, &cancel).await.unwrap();

        // Header stays intact, only the body is damaged
        let target = stored.chunks[2].content_hash;
        let key = target.storage_key();
        let mut raw = engine.backend().get(&key).await.unwrap().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        engine.backend().put(&key, &raw).await.unwrap();
        assert!(engine.read_chunk(&target, &cancel).await.unwrap_err().is_corruption());

        let again = engine.write(&data, &cancel).await.unwrap();
        assert_eq!(again.chunks, stored.chunks);
        assert_eq!(engine.stats().dedup_hits, 6);
        assert_eq!(engine.read_chunk(&target, &cancel).await.unwrap(), data[32..48].to_vec());
        let back = engine
            .read_payload(&again.chunks, &again.content_hash, &cancel)
            .await
            .unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_not_found() {
        let (engine, _temp) = create_test_engine(small_chunks()).await;
        let err = engine
            .read_chunk(&ChunkHash::of(b"never written"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_encryption_requires_key_provider() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::open(temp_dir.path()).await.unwrap();
        let options = ChunkStoreOptions {
            encrypt: true,
            ..ChunkStoreOptions::default()
        };
        let result = StorageEngine::new(Arc::new(backend), options, None, RetryPolicy::default());
        assert!(matches!(result, Err(VaultError::ConfigurationInvalid(_))));
    }

    #[tokio::test]
    async fn test_garbage_collection_respects_manifests() {
        let (engine, _temp) = create_test_engine(small_chunks()).await;
        let cancel = CancelToken::new();

        let kept = engine.write(b"kept payload", &cancel).await.unwrap();
        let dropped = engine.write(b"dropped payload", &cancel).await.unwrap();

        let mut manifest = Manifest::new(SnapshotId::new(), SnapshotKind::Full, Utc::now());
        manifest.resources.insert(ResourceType::User, kept.chunks.clone());
        manifest
            .payload_hashes
            .insert(ResourceType::User, kept.content_hash);
        manifest.seal();
        engine.put_manifest(&manifest, &cancel).await.unwrap();

        assert!(!engine
            .delete_if_unreferenced(&kept.chunks[0].content_hash, &cancel)
            .await
            .unwrap());
        assert!(engine
            .delete_if_unreferenced(&dropped.chunks[0].content_hash, &cancel)
            .await
            .unwrap());

        let swept = engine.sweep_orphans(&cancel).await.unwrap();
        assert_eq!(swept, dropped.chunks.len() - 1);
        assert_eq!(engine.chunk_count(&cancel).await.unwrap(), kept.chunks.len());
    }

    #[tokio::test]
    async fn test_gc_refuses_with_unreadable_manifest() {
        let (engine, _temp) = create_test_engine(small_chunks()).await;
        let cancel = CancelToken::new();
        let stored = engine.write(b"orphan", &cancel).await.unwrap();
        engine
            .backend()
            .put("manifests/broken.json", b"{not json")
            .await
            .unwrap();

        assert!(engine.sweep_orphans(&cancel).await.is_err());
        assert!(engine
            .read_chunk(&stored.chunks[0].content_hash, &cancel)
            .await
            .is_ok());
        assert!(engine.list_manifests(&cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manifest_round_trip_and_delete() {
        let (engine, _temp) = create_test_engine(small_chunks()).await;
        let cancel = CancelToken::new();
        let mut manifest = Manifest::new(SnapshotId::new(), SnapshotKind::Full, Utc::now());
        manifest.seal();

        engine.put_manifest(&manifest, &cancel).await.unwrap();
        let loaded = engine.get_manifest(&manifest.snapshot_id, &cancel).await.unwrap();
        assert_eq!(loaded, manifest);

        engine.delete_manifest(&manifest.snapshot_id, &cancel).await.unwrap();
        assert!(engine
            .get_manifest(&manifest.snapshot_id, &cancel)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
