//! Encryption CLI commands
//!
//! The passphrase is read from the environment so the binary can run
//! unattended; the Argon2 parameters live in settings.

use std::sync::Arc;

use clap::Subcommand;

use crate::config::{Settings, VaultPaths};
use crate::crypto::{KeyDerivationParams, KeyProvider, SecureString, StaticKeyProvider};
use crate::error::{VaultError, VaultResult};

/// Environment variable holding the encryption passphrase
pub const PASSPHRASE_ENV: &str = "IDVAULT_PASSPHRASE";

#[derive(Subcommand)]
pub enum EncryptCommands {
    /// Encrypt chunks written from now on
    Enable,

    /// Show encryption status
    Status,
}

pub fn handle_encrypt_command(
    paths: &VaultPaths,
    settings: &mut Settings,
    cmd: EncryptCommands,
) -> VaultResult<()> {
    match cmd {
        EncryptCommands::Enable => enable_encryption(paths, settings),
        EncryptCommands::Status => {
            let encryption = &settings.storage.encryption;
            println!(
                "Encryption: {}",
                if encryption.enabled { "enabled" } else { "disabled" }
            );
            if let Some(params) = &encryption.key_params {
                println!(
                    "Key derivation: Argon2id, {} KiB, {} iterations, parallelism {}",
                    params.memory_cost, params.time_cost, params.parallelism
                );
            }
            Ok(())
        }
    }
}

fn enable_encryption(paths: &VaultPaths, settings: &mut Settings) -> VaultResult<()> {
    if settings.storage.encryption.enabled {
        println!("Encryption is already enabled.");
        return Ok(());
    }

    let passphrase = passphrase_from_env()?;
    let key_params = KeyDerivationParams::new();

    // Fail now rather than on the first backup if derivation cannot work
    println!("Deriving encryption key...");
    StaticKeyProvider::from_passphrase(&passphrase, &key_params)?;

    settings.storage.encryption.enabled = true;
    settings.storage.encryption.key_params = Some(key_params);
    settings.save(paths)?;

    println!("Encryption enabled. New chunks will be sealed with AES-256-GCM.");
    println!(
        "Keep {} available; existing encrypted chunks cannot be read without it.",
        PASSPHRASE_ENV
    );
    Ok(())
}

fn passphrase_from_env() -> VaultResult<SecureString> {
    match std::env::var(PASSPHRASE_ENV) {
        Ok(value) if !value.is_empty() => Ok(SecureString::new(value)),
        _ => Err(VaultError::ConfigurationInvalid(format!(
            "{} must be set to the encryption passphrase",
            PASSPHRASE_ENV
        ))),
    }
}

/// Key provider for the stored settings, `None` when encryption is off
pub fn key_provider_from_env(settings: &Settings) -> VaultResult<Option<Arc<dyn KeyProvider>>> {
    let encryption = &settings.storage.encryption;
    if !encryption.enabled {
        return Ok(None);
    }
    let params = encryption.key_params.as_ref().ok_or_else(|| {
        VaultError::ConfigurationInvalid(
            "encryption is enabled but no key derivation parameters are stored".into(),
        )
    })?;
    let keys = StaticKeyProvider::from_passphrase(&passphrase_from_env()?, params)?;
    Ok(Some(Arc::new(keys)))
}
