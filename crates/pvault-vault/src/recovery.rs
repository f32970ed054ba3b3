//! RecoveryPhraseManager: phrase → vault lookup that never reveals how many
//! vaults exist.
//!
//! All entries live in one sealed item of the secret store. The sealed
//! plaintext is `[u32 BE json_len][json][zero padding]`, padded to a whole
//! number of 4 KiB blocks, so its size does not move with the entry count.
//! The database is created empty when the manager starts.

use std::sync::{Arc, Mutex};

use pvault_core::types::unix_now;
use pvault_crypto::{
    ct_eq, generate_phrase, normalize_phrase, open, seal, validate_custom_phrase, KeyDeriver,
    MasterKey, Pattern, PhraseRules, VaultKey, KEY_SIZE,
};
use pvault_secrets::{names, SecretStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{RecoveryError, RecoveryResult};

const DB_VERSION: u32 = 1;
const DB_AAD: &[u8] = b"pvault-recovery-db-v1";
const PAD_BLOCK: usize = 4096;

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct VaultRecoveryInfo {
    /// hex SHA-256 of the vault key
    vault_key_hash: String,
    /// normalized phrase
    phrase: String,
    pattern: Vec<u8>,
    grid_size: u8,
    created_at: u64,
}

#[derive(Serialize, Deserialize)]
struct RecoveryDatabase {
    version: u32,
    entries: Vec<VaultRecoveryInfo>,
}

impl RecoveryDatabase {
    fn empty() -> Self {
        Self {
            version: DB_VERSION,
            entries: Vec::new(),
        }
    }

    fn position(&self, hash: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.vault_key_hash == hash)
    }

    /// Constant-time phrase comparison against every entry.
    fn find_phrase(&self, normalized: &str) -> Option<&VaultRecoveryInfo> {
        let mut found = None;
        for entry in &self.entries {
            if ct_eq(entry.phrase.as_bytes(), normalized.as_bytes()) && found.is_none() {
                found = Some(entry);
            }
        }
        found
    }

    fn phrase_taken_by_other(&self, normalized: &str, hash: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.vault_key_hash != hash && ct_eq(e.phrase.as_bytes(), normalized.as_bytes()))
    }
}

pub struct RecoveryPhraseManager {
    store: Arc<dyn SecretStore>,
    deriver: KeyDeriver,
    rules: PhraseRules,
    phrase_words: usize,
    lock: Mutex<()>,
}

impl RecoveryPhraseManager {
    /// Open the recovery database, creating it empty if absent.
    pub fn new(
        store: Arc<dyn SecretStore>,
        deriver: KeyDeriver,
        rules: PhraseRules,
        phrase_words: usize,
    ) -> RecoveryResult<Self> {
        let manager = Self {
            store,
            deriver,
            rules,
            phrase_words,
            lock: Mutex::new(()),
        };
        {
            let _guard = manager.guard();
            if manager.store.get(names::RECOVERY_DB)?.is_none() {
                manager.persist(&RecoveryDatabase::empty())?;
                debug!(backend = manager.store.backend(), "recovery database initialised");
            }
        }
        Ok(manager)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn db_key(&self) -> RecoveryResult<MasterKey> {
        match self.store.get(names::RECOVERY_DB_KEY)? {
            Some(bytes) if bytes.len() == KEY_SIZE => {
                let mut raw = [0u8; KEY_SIZE];
                raw.copy_from_slice(&bytes);
                let key = MasterKey::from_bytes(raw);
                raw.zeroize();
                Ok(key)
            }
            Some(_) => Err(RecoveryError::Keychain("recovery database key is malformed".into())),
            None => {
                let key = MasterKey::generate()?;
                self.store.set(names::RECOVERY_DB_KEY, key.as_bytes())?;
                Ok(key)
            }
        }
    }

    fn load(&self) -> RecoveryResult<RecoveryDatabase> {
        let Some(sealed) = self.store.get(names::RECOVERY_DB)? else {
            return Ok(RecoveryDatabase::empty());
        };
        let key = self.db_key()?;
        let plain = Zeroizing::new(
            open(&key, DB_AAD, &sealed)
                .map_err(|_| RecoveryError::Keychain("recovery database could not be decrypted".into()))?,
        );
        let malformed = || RecoveryError::Keychain("recovery database is malformed".into());
        let len_bytes: [u8; 4] = plain.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(malformed)?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        let json = plain.get(4..4 + len).ok_or_else(malformed)?;
        serde_json::from_slice(json).map_err(|_| malformed())
    }

    fn persist(&self, db: &RecoveryDatabase) -> RecoveryResult<()> {
        let json = Zeroizing::new(
            serde_json::to_vec(db).map_err(|e| RecoveryError::Keychain(format!("serializing: {e}")))?,
        );
        let json_len = u32::try_from(json.len())
            .map_err(|_| RecoveryError::Keychain("recovery database too large".into()))?;
        let padded_len = (4 + json.len()).div_ceil(PAD_BLOCK).max(1) * PAD_BLOCK;

        let mut plain = Zeroizing::new(Vec::with_capacity(padded_len));
        plain.extend_from_slice(&json_len.to_be_bytes());
        plain.extend_from_slice(&json);
        plain.resize(padded_len, 0);

        let key = self.db_key()?;
        self.store.set(names::RECOVERY_DB, &seal(&key, DB_AAD, &plain)?)?;
        Ok(())
    }

    fn accept_phrase(&self, phrase: &str) -> RecoveryResult<Zeroizing<String>> {
        let normalized = normalize_phrase(phrase);
        validate_custom_phrase(&normalized, &self.rules).map_err(RecoveryError::WeakPhrase)?;
        Ok(normalized)
    }

    /// A fresh BIP-39 phrase of the configured length.
    pub fn generate_phrase(&self) -> RecoveryResult<Zeroizing<String>> {
        Ok(generate_phrase(self.phrase_words)?)
    }

    /// Register `phrase` for the vault `vault_key` opens. `pattern` is kept so
    /// the key can be re-derived on recovery. Replaces any earlier phrase for
    /// the same vault.
    pub fn save(&self, phrase: &str, pattern: &Pattern, vault_key: &VaultKey) -> RecoveryResult<()> {
        pattern.validate(self.deriver.rules()).map_err(pvault_crypto::CryptoError::from)?;
        let normalized = self.accept_phrase(phrase)?;
        let hash = vault_key.hash_hex();

        let _guard = self.guard();
        let mut db = self.load()?;
        if db.phrase_taken_by_other(&normalized, &hash) {
            return Err(RecoveryError::DuplicatePhrase);
        }
        db.entries.retain(|e| e.vault_key_hash != hash);
        db.entries.push(VaultRecoveryInfo {
            vault_key_hash: hash,
            phrase: normalized.to_string(),
            pattern: pattern.nodes().to_vec(),
            grid_size: pattern.grid_size(),
            created_at: unix_now(),
        });
        self.persist(&db)?;
        info!("recovery phrase saved");
        Ok(())
    }

    /// Re-derive the vault key a phrase was registered for. Runs the KDF;
    /// call from a blocking context.
    pub fn recover(&self, phrase: &str) -> RecoveryResult<VaultKey> {
        let (pattern, hash) = self.lookup(phrase)?;
        let key = self.deriver.derive(&pattern)?;
        if !ct_eq(key.hash_hex().as_bytes(), hash.as_bytes()) {
            return Err(RecoveryError::VaultNotFound);
        }
        info!("vault recovered from phrase");
        Ok(key)
    }

    /// The stored pattern for a phrase, without running the KDF.
    pub fn recover_pattern(&self, phrase: &str) -> RecoveryResult<Pattern> {
        Ok(self.lookup(phrase)?.0)
    }

    fn lookup(&self, phrase: &str) -> RecoveryResult<(Pattern, Zeroizing<String>)> {
        let normalized = normalize_phrase(phrase);
        let _guard = self.guard();
        let db = self.load()?;
        let entry = db.find_phrase(&normalized).ok_or(RecoveryError::InvalidPhrase)?;
        Ok((
            Pattern::new(entry.grid_size, entry.pattern.clone()),
            Zeroizing::new(entry.vault_key_hash.clone()),
        ))
    }

    /// Replace the phrase of an already-registered vault. With no custom
    /// phrase a new BIP-39 phrase is generated.
    pub fn regenerate(&self, vault_key: &VaultKey, custom_phrase: Option<&str>) -> RecoveryResult<Zeroizing<String>> {
        let phrase = match custom_phrase {
            Some(p) => self.accept_phrase(p)?,
            None => self.generate_phrase()?,
        };
        let hash = vault_key.hash_hex();

        let _guard = self.guard();
        let mut db = self.load()?;
        let idx = db.position(&hash).ok_or(RecoveryError::VaultNotFound)?;
        if db.phrase_taken_by_other(&phrase, &hash) {
            return Err(RecoveryError::DuplicatePhrase);
        }
        db.entries[idx].phrase.zeroize();
        db.entries[idx].phrase = phrase.to_string();
        db.entries[idx].created_at = unix_now();
        self.persist(&db)?;
        info!("recovery phrase regenerated");
        Ok(phrase)
    }

    /// Move a vault's entry to a new key after a pattern change.
    pub fn rekey(&self, old: &VaultKey, new: &VaultKey, new_pattern: &Pattern) -> RecoveryResult<bool> {
        let old_hash = old.hash_hex();
        let _guard = self.guard();
        let mut db = self.load()?;
        let Some(idx) = db.position(&old_hash) else {
            return Ok(false);
        };
        let entry = &mut db.entries[idx];
        entry.vault_key_hash = new.hash_hex();
        entry.pattern.zeroize();
        entry.pattern = new_pattern.nodes().to_vec();
        entry.grid_size = new_pattern.grid_size();
        self.persist(&db)?;
        debug!("recovery entry moved to new key");
        Ok(true)
    }

    /// Remove the entry for `vault_key`. Absent entries are not an error.
    pub fn delete(&self, vault_key: &VaultKey) -> RecoveryResult<()> {
        let hash = vault_key.hash_hex();
        let _guard = self.guard();
        let mut db = self.load()?;
        db.entries.retain(|e| e.vault_key_hash != hash);
        self.persist(&db)?;
        info!("recovery phrase deleted");
        Ok(())
    }

    pub fn has_phrase(&self, vault_key: &VaultKey) -> RecoveryResult<bool> {
        let hash = vault_key.hash_hex();
        let _guard = self.guard();
        Ok(self.load()?.position(&hash).is_some())
    }

    /// Drop every entry except the one for `vault_key`. Returns how many were
    /// removed.
    pub fn retain_only(&self, vault_key: &VaultKey) -> RecoveryResult<usize> {
        let hash = vault_key.hash_hex();
        let _guard = self.guard();
        let mut db = self.load()?;
        let before = db.entries.len();
        db.entries.retain(|e| e.vault_key_hash == hash);
        let removed = before - db.entries.len();
        self.persist(&db)?;
        Ok(removed)
    }

    /// Delete the database and its key, then start over with a new, empty
    /// database.
    pub fn destroy_all(&self) -> RecoveryResult<()> {
        let _guard = self.guard();
        self.store.delete(names::RECOVERY_DB)?;
        self.store.delete(names::RECOVERY_DB_KEY)?;
        self.persist(&RecoveryDatabase::empty())?;
        info!("recovery database destroyed");
        Ok(())
    }
}
