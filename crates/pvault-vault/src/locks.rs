//! Per-vault critical sections.
//!
//! Operations on the same vault id serialize; different vaults proceed in
//! parallel. Vault operations run on blocking threads, so these are
//! `std::sync` mutexes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct VaultLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VaultLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `vault_id`, created on first use. Entries only the
    /// table still references are dropped on the way.
    pub fn handle(&self, vault_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|id, h| id == vault_id || Arc::strong_count(h) > 1);
        map.entry(vault_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Block until `handle` is held. A panic in another holder does not make
    /// the vault unusable; the on-disk state is always consistent.
    pub fn acquire(handle: &Mutex<()>) -> MutexGuard<'_, ()> {
        handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handles for two vaults in a fixed (sorted) order, so concurrent
    /// rotations in opposite directions cannot deadlock. Same id yields one
    /// handle.
    pub fn pair(&self, a: &str, b: &str) -> (Arc<Mutex<()>>, Option<Arc<Mutex<()>>>) {
        if a == b {
            return (self.handle(a), None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        (self.handle(first), Some(self.handle(second)))
    }
}
