//! Platform keychain backend.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS: Keychain Services
//! - Linux: GNOME Keyring / Secret Service (D-Bus)
//! - Windows: Credential Manager (DPAPI)
//!
//! Values are stored base64-encoded since keychains hold strings.

use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{SecretsError, SecretsResult};
use crate::store::SecretStore;

#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, op: &'static str, name: &str) -> SecretsResult<keyring::Entry> {
        keyring::Entry::new(&self.service, name).map_err(|e| SecretsError::Keychain {
            op,
            name: name.to_string(),
            reason: format!("entry creation: {e}"),
        })
    }

    /// Check if the platform keychain is available.
    pub fn is_available(&self) -> bool {
        keyring::Entry::new(&self.service, "__pvault_probe__").is_ok()
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, name: &str) -> SecretsResult<Option<Zeroizing<Vec<u8>>>> {
        let entry = self.entry("get", name)?;
        match entry.get_password() {
            Ok(mut encoded) => {
                let decoded = STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|_| SecretsError::Encoding(name.to_string()));
                encoded.zeroize();
                Ok(Some(Zeroizing::new(decoded?)))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SecretsError::Keychain {
                op: "get",
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn set(&self, name: &str, value: &[u8]) -> SecretsResult<()> {
        let entry = self.entry("store", name)?;
        let encoded = Zeroizing::new(STANDARD.encode(value));
        entry
            .set_password(&encoded)
            .map_err(|e| SecretsError::Keychain {
                op: "store",
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(key = name, "stored secret in platform keychain");
        Ok(())
    }

    fn delete(&self, name: &str) -> SecretsResult<()> {
        let entry = self.entry("delete", name)?;
        match entry.delete_credential() {
            Ok(()) => {
                tracing::debug!(key = name, "deleted secret from platform keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()), // already deleted
            Err(e) => Err(SecretsError::Keychain {
                op: "delete",
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn backend(&self) -> &'static str {
        "keyring"
    }
}
