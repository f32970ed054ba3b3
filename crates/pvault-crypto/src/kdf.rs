//! Key derivation: Argon2id pattern → VaultKey

use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keys::VaultKey;
use crate::pattern::{Pattern, PatternRules};
use crate::{KEY_SIZE, SALT_SIZE};

/// Fixed salt for the cross-device backup key.
const BACKUP_SALT: &[u8; SALT_SIZE] = b"pvault-backup-v1";

/// Argon2id parameters for KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&pvault_core::config::CryptoConfig> for KdfParams {
    fn from(cfg: &pvault_core::config::CryptoConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

fn argon2id(input: &[u8], salt: &[u8; SALT_SIZE], params: &KdfParams) -> Result<VaultKey, CryptoError> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(input, salt, &mut *key)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id KDF failed: {e}")))?;

    Ok(VaultKey::from_bytes(*key))
}

/// Derive a device-bound vault key. The pattern is validated first; an
/// invalid pattern never reaches the KDF.
pub fn derive_vault_key(
    pattern: &Pattern,
    rules: &PatternRules,
    device_salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> Result<VaultKey, CryptoError> {
    pattern.validate(rules)?;
    argon2id(&pattern.to_kdf_bytes(), device_salt, params)
}

/// Derive the backup key for a pattern. Uses a fixed salt so the same pattern
/// yields the same key on any device.
pub fn derive_backup_key(
    pattern: &Pattern,
    rules: &PatternRules,
    params: &KdfParams,
) -> Result<VaultKey, CryptoError> {
    pattern.validate(rules)?;
    argon2id(&pattern.to_kdf_bytes(), BACKUP_SALT, params)
}

/// Cloneable handle bundling the device salt, Argon2 costs and pattern
/// rules. Callers run it on a blocking thread.
#[derive(Clone)]
pub struct KeyDeriver {
    device_salt: Zeroizing<[u8; SALT_SIZE]>,
    params: KdfParams,
    rules: PatternRules,
}

impl KeyDeriver {
    pub fn new(device_salt: [u8; SALT_SIZE], params: KdfParams, rules: PatternRules) -> Self {
        Self {
            device_salt: Zeroizing::new(device_salt),
            params,
            rules,
        }
    }

    pub fn rules(&self) -> &PatternRules {
        &self.rules
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    pub fn derive(&self, pattern: &Pattern) -> Result<VaultKey, CryptoError> {
        derive_vault_key(pattern, &self.rules, &self.device_salt, &self.params)
    }

    pub fn derive_backup(&self, pattern: &Pattern) -> Result<VaultKey, CryptoError> {
        derive_backup_key(pattern, &self.rules, &self.params)
    }
}

impl std::fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("device_salt", &"[REDACTED]")
            .field("params", &self.params)
            .field("rules", &self.rules)
            .finish()
    }
}
