//! Versioned key lookup
//!
//! The storage engine never keeps raw key material around: it asks a
//! [`KeyProvider`] for the active key when sealing a chunk and for a specific
//! version when opening one.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{VaultError, VaultResult};

use super::key_derivation::{derive_key, KeyDerivationParams};
use super::secure_memory::SecureString;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// A 256-bit key that is wiped when dropped
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() < KEY_LEN {
            return Err(VaultError::Encryption(format!(
                "Key too short: expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        Ok(Self(key))
    }

    /// Decode a base64 key as exported by a key management system
    pub fn from_base64(encoded: &str) -> VaultResult<Self> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::Encryption(format!("Invalid key encoding: {}", e)))?;
        if decoded.len() != KEY_LEN {
            let len = decoded.len();
            decoded.zeroize();
            return Err(VaultError::Encryption(format!(
                "Key must be {} bytes, got {}",
                KEY_LEN, len
            )));
        }
        let key = Self::from_slice(&decoded);
        decoded.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

/// Source of versioned encryption keys
pub trait KeyProvider: Send + Sync {
    /// Key used for new chunks, with its version
    fn get_active_key(&self) -> VaultResult<(u32, KeyMaterial)>;

    /// Key for a version recorded in a chunk envelope
    fn get_key(&self, version: u32) -> VaultResult<KeyMaterial>;
}

/// In-process keyring holding one or more key versions
pub struct StaticKeyProvider {
    keys: BTreeMap<u32, KeyMaterial>,
    active: u32,
}

impl StaticKeyProvider {
    pub fn new(version: u32, key: KeyMaterial) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, key);
        Self {
            keys,
            active: version,
        }
    }

    /// Derive version 1 from a passphrase and the persisted Argon2 parameters
    pub fn from_passphrase(
        passphrase: &SecureString,
        params: &KeyDerivationParams,
    ) -> VaultResult<Self> {
        let key = derive_key(passphrase.as_str(), params)?;
        Ok(Self::new(1, key))
    }

    /// Add a key version; rotating makes it the active one
    pub fn add_key(&mut self, version: u32, key: KeyMaterial, rotate: bool) {
        self.keys.insert(version, key);
        if rotate {
            self.active = version;
        }
    }

    pub fn active_version(&self) -> u32 {
        self.active
    }
}

impl KeyProvider for StaticKeyProvider {
    fn get_active_key(&self) -> VaultResult<(u32, KeyMaterial)> {
        let key = self.get_key(self.active)?;
        Ok((self.active, key))
    }

    fn get_key(&self, version: u32) -> VaultResult<KeyMaterial> {
        self.keys
            .get(&version)
            .cloned()
            .ok_or_else(|| VaultError::Encryption(format!("Unknown key version: {}", version)))
    }
}
