//! zstd compression for chunk bodies

use crate::error::{VaultError, VaultResult};

/// Compress with zstd at the given level
pub fn compress(data: &[u8], level: i32) -> VaultResult<Vec<u8>> {
    zstd::encode_all(data, level)
        .map_err(|e| VaultError::Storage(format!("Compression failed: {}", e)))
}

/// Decompress a zstd body; failures mean the stored bytes are damaged
pub fn decompress(data: &[u8]) -> VaultResult<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| VaultError::Storage(format!("Decompression failed: {}", e)))
}
