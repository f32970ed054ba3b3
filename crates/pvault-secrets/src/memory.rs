use std::collections::HashMap;
use std::sync::Mutex;

use zeroize::Zeroizing;

use crate::error::SecretsResult;
use crate::store::SecretStore;

/// Process-local secret store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    items: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, Zeroizing<Vec<u8>>>> {
        // a poisoned map is still a consistent map
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raw stored size of an item, for size-leak checks.
    pub fn stored_len(&self, name: &str) -> Option<usize> {
        self.items().get(name).map(|v| v.len())
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> SecretsResult<Option<Zeroizing<Vec<u8>>>> {
        Ok(self.items().get(name).cloned())
    }

    fn set(&self, name: &str, value: &[u8]) -> SecretsResult<()> {
        self.items()
            .insert(name.to_string(), Zeroizing::new(value.to_vec()));
        Ok(())
    }

    fn delete(&self, name: &str) -> SecretsResult<()> {
        self.items().remove(name);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
