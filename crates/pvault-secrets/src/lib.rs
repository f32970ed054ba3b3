//! pvault-secrets: where pvault keeps the handful of secrets that live
//! outside the vault directory
//!
//! Backends:
//!   - `keyring`: platform keychain (macOS Keychain, Secret Service, Windows
//!     Credential Manager)
//!   - `file`: one 0600 file per item in a private directory
//!   - `memory`: process-local, for tests

pub mod error;
pub mod file;
pub mod keychain;
pub mod memory;
pub mod store;

pub use error::{SecretsError, SecretsResult};
pub use file::FileSecretStore;
pub use keychain::KeyringSecretStore;
pub use memory::MemorySecretStore;
pub use store::{names, SecretStore};

use std::sync::Arc;

use pvault_core::config::{expand_tilde, SecretsConfig};

/// Open the backend named in the `[secrets]` config section.
pub fn open_store(config: &SecretsConfig) -> SecretsResult<Arc<dyn SecretStore>> {
    let store: Arc<dyn SecretStore> = match config.backend.as_str() {
        "keyring" => Arc::new(KeyringSecretStore::new(config.service.clone())),
        "file" => Arc::new(FileSecretStore::open(&expand_tilde(&config.file_dir))?),
        "memory" => Arc::new(MemorySecretStore::new()),
        other => return Err(SecretsError::UnknownBackend(other.to_string())),
    };
    tracing::debug!(backend = store.backend(), "secret store opened");
    Ok(store)
}
