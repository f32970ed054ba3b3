//! DuressHandler: one designated pattern that, when used to unlock,
//! destroys every other vault on the device.

use std::sync::Arc;

use pvault_crypto::{ct_eq, VaultKey};
use pvault_secrets::{names, SecretStore, SecretsError};
use tracing::{error, info, warn};

use crate::error::{DuressError, DuressResult};
use crate::recovery::RecoveryPhraseManager;
use crate::storage::{short, VaultStorage};

const DURESS_DOMAIN: &[u8] = b"pvault-duress";

/// A wipe target that could not be destroyed, even after a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipeFailure {
    pub target: String,
    pub reason: String,
}

/// Outcome of a duress wipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WipeReport {
    /// Vaults whose index and blobs were removed
    pub destroyed: usize,
    /// Recovery entries removed
    pub recovery_entries_removed: usize,
    pub failed: Vec<WipeFailure>,
}

impl WipeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct DuressHandler {
    store: Arc<dyn SecretStore>,
    storage: Arc<VaultStorage>,
    recovery: Arc<RecoveryPhraseManager>,
}

impl DuressHandler {
    pub fn new(store: Arc<dyn SecretStore>, storage: Arc<VaultStorage>, recovery: Arc<RecoveryPhraseManager>) -> Self {
        Self {
            store,
            storage,
            recovery,
        }
    }

    fn marker(key: &VaultKey) -> [u8; 32] {
        key.tagged_hash(DURESS_DOMAIN)
    }

    /// Designate the vault `key` opens as the duress vault, replacing any
    /// earlier designation. Shared vaults are refused.
    pub fn set_as_duress_vault(&self, key: &VaultKey) -> DuressResult<()> {
        if self.storage.load_index(key)?.is_shared_vault {
            return Err(DuressError::SharedVault);
        }
        self.store.set(names::DURESS_MARKER, &Self::marker(key))?;
        info!("duress vault set");
        Ok(())
    }

    pub fn is_duress_key(&self, key: &VaultKey) -> Result<bool, SecretsError> {
        Ok(match self.store.get(names::DURESS_MARKER)? {
            Some(stored) => ct_eq(&stored, &Self::marker(key)),
            None => false,
        })
    }

    pub fn has_duress_vault(&self) -> Result<bool, SecretsError> {
        Ok(self.store.get(names::DURESS_MARKER)?.is_some())
    }

    pub fn clear(&self) -> DuressResult<()> {
        self.store.delete(names::DURESS_MARKER)?;
        info!("duress vault cleared");
        Ok(())
    }

    /// A vault that became shared can no longer be the duress vault.
    pub fn on_vault_shared(&self, key: &VaultKey) -> Result<(), SecretsError> {
        if self.is_duress_key(key)? {
            self.store.delete(names::DURESS_MARKER)?;
            warn!("duress designation removed from shared vault");
        }
        Ok(())
    }

    /// Move the designation along with a pattern change.
    pub fn rekey(&self, old: &VaultKey, new: &VaultKey) -> Result<(), SecretsError> {
        if self.is_duress_key(old)? {
            self.store.set(names::DURESS_MARKER, &Self::marker(new))?;
        }
        Ok(())
    }

    /// Destroy every vault except the one `duress_key` opens, along with
    /// their recovery entries. Each failed deletion is retried once; what
    /// still fails is logged and reported. Never fails as a whole.
    pub fn perform_nuclear_wipe(&self, duress_key: &VaultKey) -> WipeReport {
        let mut report = WipeReport::default();

        let targets = VaultStorage::vault_id(duress_key).and_then(|keep| {
            let ids = self
                .storage
                .known_vault_ids()
                .or_else(|_| self.storage.known_vault_ids())?;
            Ok(ids.into_iter().filter(|id| *id != keep).collect::<Vec<_>>())
        });
        match targets {
            Ok(ids) => {
                for id in ids {
                    let result = self
                        .storage
                        .destroy_vault_files(&id)
                        .or_else(|_| self.storage.destroy_vault_files(&id));
                    match result {
                        Ok(_) => report.destroyed += 1,
                        Err(e) => {
                            error!(vault = short(&id), error = %e, "duress wipe could not destroy vault");
                            report.failed.push(WipeFailure {
                                target: format!("vault {}", short(&id)),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "duress wipe could not list vaults");
                report.failed.push(WipeFailure {
                    target: "vault directory".into(),
                    reason: e.to_string(),
                });
            }
        }

        match self
            .recovery
            .retain_only(duress_key)
            .or_else(|_| self.recovery.retain_only(duress_key))
        {
            Ok(n) => report.recovery_entries_removed = n,
            Err(e) => {
                error!(error = %e, "duress wipe could not clear recovery entries");
                report.failed.push(WipeFailure {
                    target: "recovery database".into(),
                    reason: e.to_string(),
                });
            }
        }

        info!(
            destroyed = report.destroyed,
            recovery_entries = report.recovery_entries_removed,
            failures = report.failed.len(),
            "duress wipe finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvault_crypto::{KdfParams, KeyDeriver, Pattern, PatternRules, PhraseRules};
    use pvault_secrets::MemorySecretStore;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        storage: Arc<VaultStorage>,
        recovery: Arc<RecoveryPhraseManager>,
        duress: DuressHandler,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let storage = Arc::new(VaultStorage::with_params(tmp.path(), 64 * 1024, 4096).unwrap());
        let deriver = KeyDeriver::new(
            [3u8; 16],
            KdfParams {
                mem_cost_kib: 1024,
                time_cost: 1,
                parallelism: 1,
            },
            PatternRules::default(),
        );
        let recovery = Arc::new(RecoveryPhraseManager::new(store.clone(), deriver, PhraseRules::default(), 12).unwrap());
        let duress = DuressHandler::new(store, storage.clone(), recovery.clone());
        Fixture {
            _tmp: tmp,
            storage,
            recovery,
            duress,
        }
    }

    fn key(b: u8) -> VaultKey {
        VaultKey::from_bytes([b; 32])
    }

    #[test]
    fn test_marker_roundtrip() {
        let f = fixture();
        assert!(!f.duress.is_duress_key(&key(1)).unwrap());
        f.duress.set_as_duress_vault(&key(1)).unwrap();
        assert!(f.duress.is_duress_key(&key(1)).unwrap());
        assert!(!f.duress.is_duress_key(&key(2)).unwrap());
        f.duress.clear().unwrap();
        assert!(!f.duress.has_duress_vault().unwrap());
    }

    #[test]
    fn test_shared_vault_rejected() {
        let f = fixture();
        f.storage.mark_shared(&key(1), "share").unwrap();
        assert!(matches!(f.duress.set_as_duress_vault(&key(1)), Err(DuressError::SharedVault)));
    }

    #[test]
    fn test_sharing_clears_marker() {
        let f = fixture();
        f.duress.set_as_duress_vault(&key(1)).unwrap();
        f.duress.on_vault_shared(&key(1)).unwrap();
        assert!(!f.duress.has_duress_vault().unwrap());
    }

    #[test]
    fn test_wipe_keeps_only_duress_vault() {
        let f = fixture();
        for b in 1..=3 {
            f.storage.store_file(b"secret", "s", "text/plain", &key(b)).unwrap();
        }
        let pattern = Pattern::new(5, vec![0, 6, 12, 18, 24, 20]);
        f.recovery
            .save("orbit velvet canyon mirror thunder lantern pepper", &pattern, &key(1))
            .unwrap();
        f.recovery
            .save("harbor quiet falcon ribbon saddle glimpse tundra", &pattern, &key(3))
            .unwrap();

        f.duress.set_as_duress_vault(&key(3)).unwrap();
        let report = f.duress.perform_nuclear_wipe(&key(3));

        assert!(report.is_complete());
        assert_eq!(report.destroyed, 2);
        assert_eq!(report.recovery_entries_removed, 1);
        assert_eq!(
            f.storage.known_vault_ids().unwrap(),
            vec![VaultStorage::vault_id(&key(3)).unwrap()]
        );
        assert_eq!(f.storage.list_files(&key(3)).unwrap().len(), 1);
        assert!(f.recovery.has_phrase(&key(3)).unwrap());
        assert!(!f.recovery.has_phrase(&key(1)).unwrap());
        // the other patterns now open empty vaults
        assert!(f.storage.list_files(&key(1)).unwrap().is_empty());
    }

    #[test]
    fn test_wipe_reports_unlistable_directory() {
        let f = fixture();
        f.storage.store_file(b"secret", "s", "text/plain", &key(1)).unwrap();
        std::fs::remove_dir_all(f.storage.dir()).unwrap();

        let report = f.duress.perform_nuclear_wipe(&key(3));

        assert_eq!(report.destroyed, 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].target, "vault directory");
    }
}
