use zeroize::Zeroizing;

use crate::error::SecretsResult;

/// Small named secrets (salts, wrapped keys, sealed databases) kept outside
/// the vault directory.
///
/// Implementations are synchronous; callers on an async runtime go through
/// `spawn_blocking`.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> SecretsResult<Option<Zeroizing<Vec<u8>>>>;

    fn set(&self, name: &str, value: &[u8]) -> SecretsResult<()>;

    /// Remove an item. Deleting an absent item succeeds.
    fn delete(&self, name: &str) -> SecretsResult<()>;

    /// Backend label for logs.
    fn backend(&self) -> &'static str;
}

/// Well-known item names
pub mod names {
    /// Per-device Argon2id salt for pattern keys
    pub const DEVICE_SALT: &str = "device-salt";
    /// Sealed recovery database
    pub const RECOVERY_DB: &str = "recovery-db";
    /// Random key sealing the recovery database
    pub const RECOVERY_DB_KEY: &str = "recovery-db-key";
    /// Tagged hash of the duress vault key
    pub const DURESS_MARKER: &str = "duress-marker";
}
