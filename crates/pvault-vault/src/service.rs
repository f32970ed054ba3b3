//! VaultService: async facade over the vault engine.
//!
//! Key derivation and every disk-touching operation run on tokio's blocking
//! pool; the service itself is cheap to clone and share.

use std::path::PathBuf;
use std::sync::Arc;

use pvault_core::config::PvaultConfig;
use pvault_core::types::VaultStats;
use pvault_crypto::{generate_device_salt, KdfParams, KeyDeriver, Pattern, PatternRules, PhraseRules, VaultKey, SALT_SIZE};
use pvault_secrets::{names, SecretStore};
use tracing::{error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::duress::{DuressHandler, WipeReport};
use crate::error::{RecoveryError, VaultError, VaultResult};
use crate::index::FileEntry;
use crate::recovery::RecoveryPhraseManager;
use crate::storage::VaultStorage;

/// Load the per-device salt, generating and persisting it on first use.
pub fn load_device_salt(store: &dyn SecretStore) -> VaultResult<[u8; SALT_SIZE]> {
    match store.get(names::DEVICE_SALT)? {
        Some(bytes) => <[u8; SALT_SIZE]>::try_from(bytes.as_slice())
            .map_err(|_| VaultError::Encoding(format!("device salt must be {SALT_SIZE} bytes, found {}", bytes.len()))),
        None => {
            let salt = generate_device_salt()?;
            store.set(names::DEVICE_SALT, &salt)?;
            info!(backend = store.backend(), "device salt generated");
            Ok(salt)
        }
    }
}

/// Result of unlocking with a pattern.
pub struct Unlocked {
    pub key: VaultKey,
    pub stats: VaultStats,
    /// Present when the pattern was the duress pattern.
    pub wipe: Option<WipeReport>,
}

#[derive(Clone)]
pub struct VaultService {
    storage: Arc<VaultStorage>,
    deriver: KeyDeriver,
    recovery: Arc<RecoveryPhraseManager>,
    duress: Arc<DuressHandler>,
}

async fn blocking<T, F>(f: F) -> VaultResult<T>
where
    F: FnOnce() -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::Task(e.to_string()))?
}

impl VaultService {
    /// Wire up storage, recovery and duress from configuration.
    pub fn open(config: &PvaultConfig, store: Arc<dyn SecretStore>) -> VaultResult<Self> {
        let salt = load_device_salt(store.as_ref())?;
        let deriver = KeyDeriver::new(
            salt,
            KdfParams::from(&config.crypto),
            PatternRules::from(&config.pattern),
        );
        let storage = Arc::new(VaultStorage::open(&config.vault)?);
        let recovery = Arc::new(
            RecoveryPhraseManager::new(
                store.clone(),
                deriver.clone(),
                PhraseRules::from(&config.recovery),
                config.recovery.phrase_words,
            )?,
        );
        let duress = Arc::new(DuressHandler::new(store, storage.clone(), recovery.clone()));
        Ok(Self::from_parts(storage, deriver, recovery, duress))
    }

    pub fn from_parts(
        storage: Arc<VaultStorage>,
        deriver: KeyDeriver,
        recovery: Arc<RecoveryPhraseManager>,
        duress: Arc<DuressHandler>,
    ) -> Self {
        Self {
            storage,
            deriver,
            recovery,
            duress,
        }
    }

    pub fn storage(&self) -> &Arc<VaultStorage> {
        &self.storage
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    pub fn recovery(&self) -> &Arc<RecoveryPhraseManager> {
        &self.recovery
    }

    pub fn duress(&self) -> &Arc<DuressHandler> {
        &self.duress
    }

    pub async fn derive_key(&self, pattern: Pattern) -> VaultResult<VaultKey> {
        let deriver = self.deriver.clone();
        blocking(move || Ok(deriver.derive(&pattern)?)).await
    }

    /// Derive the key for `pattern` and open its vault. The duress pattern
    /// wipes every other vault first; either way the caller gets an open,
    /// normal-looking vault. Failures of the duress check or the wipe are
    /// logged, never returned.
    pub async fn unlock(&self, pattern: Pattern) -> VaultResult<Unlocked> {
        let key = self.derive_key(pattern).await?;
        let storage = self.storage.clone();
        let duress = self.duress.clone();
        let k = key.clone();
        let (stats, wipe) = blocking(move || {
            let wipe = match duress.is_duress_key(&k) {
                Ok(true) => Some(duress.perform_nuclear_wipe(&k)),
                Ok(false) => None,
                Err(e) => {
                    error!(error = %e, "duress marker unreadable, unlocking without it");
                    None
                }
            };
            Ok((storage.vault_stats(&k)?, wipe))
        })
        .await?;
        Ok(Unlocked { key, stats, wipe })
    }

    pub async fn store_file(&self, key: &VaultKey, data: Vec<u8>, filename: String, mime_type: String) -> VaultResult<Uuid> {
        let storage = self.storage.clone();
        let key = key.clone();
        let data = Zeroizing::new(data);
        blocking(move || storage.store_file(&data, &filename, &mime_type, &key)).await
    }

    /// Stream a file from disk into the vault.
    pub async fn store_path(&self, key: &VaultKey, path: PathBuf, filename: String, mime_type: String) -> VaultResult<Uuid> {
        let storage = self.storage.clone();
        let key = key.clone();
        blocking(move || {
            let mut file = std::fs::File::open(&path)?;
            let len = file.metadata()?.len();
            storage.store_stream(&mut file, len, &filename, &mime_type, &key)
        })
        .await
    }

    pub async fn retrieve_file(&self, key: &VaultKey, file_id: Uuid) -> VaultResult<(FileEntry, Zeroizing<Vec<u8>>)> {
        let storage = self.storage.clone();
        let key = key.clone();
        blocking(move || storage.retrieve_file(&file_id, &key)).await
    }

    /// Decrypt a file to `dest`. Plaintext goes to a sibling temp file and is
    /// renamed into place only after the whole stream authenticates.
    pub async fn retrieve_to_path(&self, key: &VaultKey, file_id: Uuid, dest: PathBuf) -> VaultResult<FileEntry> {
        let storage = self.storage.clone();
        let key = key.clone();
        blocking(move || {
            let tmp = pvault_core::fsutil::temp_path(&dest);
            let result: VaultResult<FileEntry> = (|| {
                let mut writer = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
                let entry = storage.retrieve_to_writer(&file_id, &key, &mut writer)?;
                let file = writer.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()?;
                std::fs::rename(&tmp, &dest)?;
                Ok(entry)
            })();
            if result.is_err() {
                if let Err(e) = pvault_core::fsutil::remove_if_exists(&tmp) {
                    warn!(path = %tmp.display(), error = %e, "could not remove partial output");
                }
            }
            result
        })
        .await
    }

    pub async fn delete_file(&self, key: &VaultKey, file_id: Uuid) -> VaultResult<()> {
        let storage = self.storage.clone();
        let key = key.clone();
        blocking(move || storage.delete_file(&file_id, &key)).await
    }

    pub async fn list_files(&self, key: &VaultKey) -> VaultResult<Vec<FileEntry>> {
        let storage = self.storage.clone();
        let key = key.clone();
        blocking(move || storage.list_files(&key)).await
    }

    pub async fn vault_stats(&self, key: &VaultKey) -> VaultResult<VaultStats> {
        let storage = self.storage.clone();
        let key = key.clone();
        blocking(move || storage.vault_stats(&key)).await
    }

    pub async fn set_custom_name(&self, key: &VaultKey, name: Option<String>) -> VaultResult<()> {
        let storage = self.storage.clone();
        let key = key.clone();
        blocking(move || storage.set_custom_name(&key, name)).await
    }

    /// Flag the vault as shared and drop any duress designation on it.
    pub async fn mark_shared(&self, key: &VaultKey, shared_vault_id: String) -> VaultResult<()> {
        let storage = self.storage.clone();
        let duress = self.duress.clone();
        let key = key.clone();
        blocking(move || {
            storage.mark_shared(&key, &shared_vault_id)?;
            duress.on_vault_shared(&key)?;
            Ok(())
        })
        .await
    }

    /// Change the pattern of the vault `old_key` opens. The recovery entry and
    /// duress designation follow the vault. Returns the new key.
    pub async fn change_pattern(&self, old_key: &VaultKey, new_pattern: Pattern) -> VaultResult<VaultKey> {
        let new_key = self.derive_key(new_pattern.clone()).await?;
        let storage = self.storage.clone();
        let recovery = self.recovery.clone();
        let duress = self.duress.clone();
        let old = old_key.clone();
        let new = new_key.clone();
        blocking(move || {
            storage.change_vault_key(&old, &new)?;
            if let Err(e) = recovery.rekey(&old, &new, &new_pattern) {
                warn!(error = %e, "recovery entry not moved to new pattern");
            }
            if let Err(e) = duress.rekey(&old, &new) {
                warn!(error = %e, "duress designation not moved to new pattern");
            }
            Ok(())
        })
        .await?;
        Ok(new_key)
    }

    /// Recover a vault key from a phrase (runs the KDF off-thread).
    pub async fn recover(&self, phrase: String) -> Result<VaultKey, RecoveryError> {
        let recovery = self.recovery.clone();
        let phrase = Zeroizing::new(phrase);
        tokio::task::spawn_blocking(move || recovery.recover(&phrase))
            .await
            .map_err(|e| RecoveryError::Keychain(format!("background task failed: {e}")))?
    }
}
