//! Cryptographic functions for idvault
//!
//! Provides AES-256-GCM chunk envelopes, versioned key lookup and Argon2id
//! key derivation for optional at-rest encryption of snapshot data.

pub mod encryption;
pub mod key_derivation;
pub mod key_provider;
pub mod secure_memory;

pub use encryption::{open, seal, seal_with, EnvelopeHeader};
pub use key_derivation::{derive_key, KeyDerivationParams};
pub use key_provider::{KeyMaterial, KeyProvider, StaticKeyProvider};
pub use secure_memory::SecureString;
