//! AES-256-GCM chunk envelopes
//!
//! Every encrypted chunk body is a self-describing envelope:
//!
//! ```text
//! +---------+-----------+-------------+-----------+----------------------+
//! | version | algorithm | key version | nonce     | ciphertext + tag     |
//! | 1 byte  | 1 byte    | 4 bytes LE  | 12 bytes  | n + 16 bytes         |
//! +---------+-----------+-------------+-----------+----------------------+
//! ```
//!
//! The 18-byte header is bound to the ciphertext as associated data, so a
//! tampered key version fails authentication instead of picking another key.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};

use crate::error::{VaultError, VaultResult};

use super::key_provider::{KeyMaterial, KeyProvider};

/// Current envelope format
pub const ENVELOPE_VERSION: u8 = 1;
/// Algorithm id for AES-256-GCM
pub const ALGORITHM_AES_256_GCM: u8 = 1;

/// Size of the AES-GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = 1 + 1 + 4 + NONCE_SIZE;

/// Parsed envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub algorithm: u8,
    pub key_version: u32,
    pub nonce: [u8; NONCE_SIZE],
}

impl EnvelopeHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.version;
        out[1] = self.algorithm;
        out[2..6].copy_from_slice(&self.key_version.to_le_bytes());
        out[6..].copy_from_slice(&self.nonce);
        out
    }

    /// Read the header from the front of an envelope
    pub fn parse(envelope: &[u8]) -> VaultResult<Self> {
        if envelope.len() < HEADER_SIZE + TAG_SIZE {
            return Err(VaultError::Encryption(format!(
                "Envelope too short: {} bytes",
                envelope.len()
            )));
        }
        let version = envelope[0];
        if version != ENVELOPE_VERSION {
            return Err(VaultError::Encryption(format!(
                "Unsupported envelope version: {}",
                version
            )));
        }
        let algorithm = envelope[1];
        if algorithm != ALGORITHM_AES_256_GCM {
            return Err(VaultError::Encryption(format!(
                "Unsupported encryption algorithm: {}",
                algorithm
            )));
        }
        let mut key_version = [0u8; 4];
        key_version.copy_from_slice(&envelope[2..6]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&envelope[6..HEADER_SIZE]);
        Ok(Self {
            version,
            algorithm,
            key_version: u32::from_le_bytes(key_version),
            nonce,
        })
    }
}

/// Encrypt with the given key, generating a fresh random nonce
pub fn seal(plaintext: &[u8], key_version: u32, key: &KeyMaterial) -> VaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Encryption(format!("Failed to create cipher: {}", e)))?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let header = EnvelopeHeader {
        version: ENVELOPE_VERSION,
        algorithm: ALGORITHM_AES_256_GCM,
        key_version,
        nonce,
    }
    .to_bytes();

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &header,
            },
        )
        .map_err(|e| VaultError::Encryption(format!("Encryption failed: {}", e)))?;

    let mut envelope = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    envelope.extend_from_slice(&header);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Seal with the provider's active key
pub fn seal_with(plaintext: &[u8], keys: &dyn KeyProvider) -> VaultResult<Vec<u8>> {
    let (version, key) = keys.get_active_key()?;
    seal(plaintext, version, &key)
}

/// Decrypt an envelope, looking up the key version it names
pub fn open(envelope: &[u8], keys: &dyn KeyProvider) -> VaultResult<Vec<u8>> {
    let header = EnvelopeHeader::parse(envelope)?;
    let key = keys.get_key(header.key_version)?;

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Encryption(format!("Failed to create cipher: {}", e)))?;

    cipher
        .decrypt(
            Nonce::from_slice(&header.nonce),
            Payload {
                msg: &envelope[HEADER_SIZE..],
                aad: &envelope[..HEADER_SIZE],
            },
        )
        .map_err(|_| {
            VaultError::Encryption("Decryption failed: invalid key or corrupted data".to_string())
        })
}
