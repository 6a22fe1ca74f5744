//! Content-addressed chunk primitives
//!
//! Chunks are keyed by the BLAKE3 hash of their plaintext, uncompressed
//! bytes. What lands in the backend is a small frame:
//!
//! ```text
//! magic "IDC1" (4) | flags (1) | plaintext length u64 LE (8) | body
//! ```
//!
//! where the body is the plaintext, optionally zstd-compressed and then
//! optionally sealed in an encryption envelope.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{VaultError, VaultResult};

/// A BLAKE3 content hash
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ChunkHash([u8; 32]);

impl ChunkHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash bytes using BLAKE3
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> VaultResult<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| VaultError::Storage(format!("Invalid chunk hash '{}': {}", s, e)))?;
        Ok(Self(bytes))
    }

    /// Backend key: `chunks/<first two hex chars>/<full hex>`
    pub fn storage_key(&self) -> String {
        let hex = self.to_hex();
        format!("{}{}/{}", CHUNK_PREFIX, &hex[..2], hex)
    }

    /// Inverse of [`ChunkHash::storage_key`]
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(CHUNK_PREFIX)?;
        let (_, hex) = rest.split_once('/')?;
        Self::from_hex(hex).ok()
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", self.to_hex())
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ChunkHash {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ChunkHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Key prefix under which all chunks live
pub const CHUNK_PREFIX: &str = "chunks/";

/// Manifest entry for one stored chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub content_hash: ChunkHash,
    /// Plaintext length
    pub size: u64,
    pub compressed: bool,
    pub encrypted: bool,
}

/// Result of writing one payload through the chunk store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    /// Hash of the whole payload
    pub content_hash: ChunkHash,
    pub size: u64,
    pub chunks: Vec<ChunkRef>,
}

const MAGIC: [u8; 4] = *b"IDC1";
const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_ENCRYPTED: u8 = 0b0000_0010;
const FRAME_HEADER_LEN: usize = 4 + 1 + 8;

/// Decoded chunk frame header plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub compressed: bool,
    pub encrypted: bool,
    pub plaintext_len: u64,
    pub body: Vec<u8>,
}

impl ChunkFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.body.len());
        out.extend_from_slice(&MAGIC);
        out.push(flags);
        out.extend_from_slice(&self.plaintext_len.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a stored frame; any structural problem is corruption
    pub fn decode(hash: &ChunkHash, bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(VaultError::corruption(
                hash.to_hex(),
                format!("frame truncated to {} bytes", bytes.len()),
            ));
        }
        if bytes[..4] != MAGIC {
            return Err(VaultError::corruption(hash.to_hex(), "bad frame magic"));
        }
        let flags = bytes[4];
        if flags & !(FLAG_COMPRESSED | FLAG_ENCRYPTED) != 0 {
            return Err(VaultError::corruption(
                hash.to_hex(),
                format!("unknown frame flags {:#04x}", flags),
            ));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[5..FRAME_HEADER_LEN]);
        Ok(Self {
            compressed: flags & FLAG_COMPRESSED != 0,
            encrypted: flags & FLAG_ENCRYPTED != 0,
            plaintext_len: u64::from_le_bytes(len),
            body: bytes[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}
