//! Key derivation using Argon2id
//!
//! Derives chunk encryption keys from operator passphrases using Argon2id,
//! a memory-hard key derivation function resistant to GPU/ASIC attacks.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2, Params,
};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

use super::key_provider::{KeyMaterial, KEY_LEN};

/// Parameters for key derivation, persisted in settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivationParams {
    /// Salt for key derivation (base64 encoded)
    pub salt: String,
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub memory_cost: u32,
    /// Time cost (iterations, default: 3)
    pub time_cost: u32,
    /// Parallelism degree (default: 4)
    pub parallelism: u32,
}

impl Default for KeyDerivationParams {
    fn default() -> Self {
        Self {
            salt: String::new(),
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KeyDerivationParams {
    /// Create new params with a random salt
    pub fn new() -> Self {
        let salt = SaltString::generate(&mut OsRng);
        Self {
            salt: salt.to_string(),
            ..Default::default()
        }
    }

    /// Cheap parameters for tests; never use for real keys
    #[cfg(test)]
    pub fn insecure_fast() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
            ..Self::new()
        }
    }
}

/// Derive a chunk encryption key from a passphrase
pub fn derive_key(passphrase: &str, params: &KeyDerivationParams) -> VaultResult<KeyMaterial> {
    if passphrase.is_empty() {
        return Err(VaultError::Encryption("Passphrase must not be empty".into()));
    }

    let salt = SaltString::from_b64(&params.salt)
        .map_err(|e| VaultError::Encryption(format!("Invalid salt: {}", e)))?;

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::Encryption(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2_params,
    );

    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| VaultError::Encryption(format!("Key derivation failed: {}", e)))?;

    let hash_output = hash
        .hash
        .ok_or_else(|| VaultError::Encryption("No hash output generated".to_string()))?;

    KeyMaterial::from_slice(hash_output.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_passphrase_same_key() {
        let params = KeyDerivationParams::insecure_fast();
        let key1 = derive_key("test_passphrase", &params).unwrap();
        let key2 = derive_key("test_passphrase", &params).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_different_passphrase_different_key() {
        let params = KeyDerivationParams::insecure_fast();
        let key1 = derive_key("passphrase1", &params).unwrap();
        let key2 = derive_key("passphrase2", &params).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_different_salt_different_key() {
        let key1 = derive_key("same", &KeyDerivationParams::insecure_fast()).unwrap();
        let key2 = derive_key("same", &KeyDerivationParams::insecure_fast()).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_invalid_salt_rejected() {
        let params = KeyDerivationParams {
            salt: "!!".into(),
            ..KeyDerivationParams::insecure_fast()
        };
        assert!(matches!(
            derive_key("pass", &params),
            Err(VaultError::Encryption(_))
        ));
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(derive_key("", &KeyDerivationParams::insecure_fast()).is_err());
    }
}
