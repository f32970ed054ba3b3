//! VaultIndex: the encrypted table of contents for one vault's blob.
//!
//! Serialized as JSON and sealed under the VaultKey. v1 indexes carry no
//! `encrypted_master_key`; their files were encrypted directly under the
//! vault key and are tagged `key_source = vault_key`.

use base64::{engine::general_purpose::STANDARD, Engine};
use pvault_core::types::{unix_now, VaultStats};
use pvault_crypto::{open, seal, CryptoError, MasterKey, VaultKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};

/// Current index format version
pub const INDEX_VERSION: u32 = 2;

/// AAD bound to every sealed index
const INDEX_AAD: &[u8] = b"pvault-index";

/// Which key encrypted a file's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    MasterKey,
    /// Legacy v1 entry, encrypted directly under the vault key
    VaultKey,
}

impl KeySource {
    fn legacy() -> Self {
        KeySource::VaultKey
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    /// Byte offset of the ciphertext in the blob
    pub offset: u64,
    /// Ciphertext length in bytes
    pub size: u64,
    #[serde(default)]
    pub original_size: u64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub created_at: u64,
    /// base64 of a thumbnail sealed under the entry's key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_thumbnail: Option<String>,
    #[serde(default = "KeySource::legacy")]
    pub key_source: KeySource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub share_id: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultIndex {
    pub version: u32,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Allocation cursor: first free byte in the blob
    #[serde(default)]
    pub next_offset: u64,
    /// Blob capacity in bytes
    #[serde(default)]
    pub total_size: u64,
    /// base64 of the MasterKey sealed under the current VaultKey
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_master_key: Option<String>,
    /// Bumped when a restore installs a new blob file
    #[serde(default)]
    pub blob_generation: u32,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub is_shared_vault: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_vault_id: Option<String>,
    #[serde(default)]
    pub active_shares: Vec<ShareRecord>,
    /// Set on the old index while a pattern change to this vault id is in
    /// flight. The move is committed once an index exists at that id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotating_to: Option<String>,
    /// Set on the new index until the old address has been cleaned up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_from: Option<String>,
}

impl VaultIndex {
    /// Empty v2 index for a freshly preallocated blob.
    pub fn new(total_size: u64) -> Self {
        Self {
            version: INDEX_VERSION,
            files: Vec::new(),
            next_offset: 0,
            total_size,
            encrypted_master_key: None,
            blob_generation: 0,
            created_at: unix_now(),
            custom_name: None,
            is_shared_vault: false,
            shared_vault_id: None,
            active_shares: Vec::new(),
            rotating_to: None,
            rotated_from: None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.version < INDEX_VERSION || self.encrypted_master_key.is_none()
    }

    pub fn has_legacy_entries(&self) -> bool {
        self.files
            .iter()
            .any(|f| !f.is_deleted && f.key_source == KeySource::VaultKey)
    }

    pub fn live_files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|f| !f.is_deleted)
    }

    pub fn find(&self, file_id: &Uuid) -> Option<&FileEntry> {
        self.live_files().find(|f| &f.file_id == file_id)
    }

    pub fn find_mut(&mut self, file_id: &Uuid) -> Option<&mut FileEntry> {
        self.files
            .iter_mut()
            .find(|f| !f.is_deleted && &f.file_id == file_id)
    }

    pub fn available(&self) -> u64 {
        self.total_size.saturating_sub(self.next_offset)
    }

    pub fn stats(&self) -> VaultStats {
        VaultStats {
            capacity: self.total_size,
            used: self.next_offset,
            files: self.live_files().count(),
            deleted: self.files.iter().filter(|f| f.is_deleted).count(),
        }
    }

    /// Seal `master` under `vault_key` and store it in the index.
    pub fn set_master_key(&mut self, master: &MasterKey, vault_key: &VaultKey) -> VaultResult<()> {
        self.encrypted_master_key = Some(STANDARD.encode(master.wrap(vault_key)?));
        Ok(())
    }

    /// Unwrap the MasterKey. Missing or undecodable wrapping is an auth failure.
    pub fn master_key(&self, vault_key: &VaultKey) -> Result<MasterKey, CryptoError> {
        let encoded = self.encrypted_master_key.as_ref().ok_or(CryptoError::Decrypt)?;
        let wrapped = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| CryptoError::Decrypt)?;
        MasterKey::unwrap_with(vault_key, &wrapped)
    }

    pub fn to_json(&self) -> VaultResult<Zeroizing<Vec<u8>>> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| VaultError::Encoding(format!("serializing index: {e}")))
    }

    pub fn from_json(bytes: &[u8]) -> VaultResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| VaultError::Encoding(format!("parsing index: {e}")))
    }

    /// `[0x01][nonce][ciphertext + tag]` under the vault key
    pub fn seal(&self, vault_key: &VaultKey) -> VaultResult<Vec<u8>> {
        Ok(seal(vault_key, INDEX_AAD, &self.to_json()?)?)
    }

    /// Open a sealed index. Any failure (wrong key, tampering, garbage)
    /// returns `None`; callers treat that as "no vault here".
    pub fn open_sealed(vault_key: &VaultKey, sealed: &[u8]) -> Option<Self> {
        let json = Zeroizing::new(open(vault_key, INDEX_AAD, sealed).ok()?);
        Self::from_json(&json).ok()
    }
}
