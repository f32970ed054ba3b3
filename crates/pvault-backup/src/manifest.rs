//! Backup version manifest: the last object written for a backup, so its
//! presence marks the backup as complete.

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, BackupResult};

pub const MANIFEST_VERSION: u32 = 1;

/// One uploaded slice of the encrypted container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupChunk {
    pub index: u32,
    /// BLAKE3 of the encrypted chunk bytes (hex)
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupVersionEntry {
    pub version: u32,
    pub backup_id: String,
    /// Unix time in milliseconds
    pub created_at: u64,
    /// Encrypted container size in bytes
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<BackupChunk>,
    /// HMAC-SHA256 under the backup key, checked before any download
    pub verification_token: String,
    #[serde(default)]
    pub file_count: usize,
}

impl BackupVersionEntry {
    pub fn from_bytes(data: &[u8]) -> BackupResult<Self> {
        let entry: Self = serde_json::from_slice(data)
            .map_err(|e| BackupError::Encoding(format!("parsing manifest: {e}")))?;
        if entry.version > MANIFEST_VERSION {
            return Err(BackupError::Encoding(format!(
                "manifest version {} is newer than supported {MANIFEST_VERSION}",
                entry.version
            )));
        }
        Ok(entry)
    }

    pub fn to_bytes(&self) -> BackupResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| BackupError::Encoding(format!("serializing manifest: {e}")))
    }

    /// Chunks sorted by index, checked to be exactly `0..n` and to add up to
    /// `total_size`.
    pub fn ordered_chunks(&self) -> BackupResult<Vec<BackupChunk>> {
        let mut chunks = self.chunks.clone();
        chunks.sort_by_key(|c| c.index);
        let contiguous = chunks.iter().enumerate().all(|(i, c)| c.index as usize == i);
        let sum: u64 = chunks.iter().map(|c| c.size).sum();
        if !contiguous || sum != self.total_size {
            return Err(BackupError::DownloadFailed(format!(
                "manifest for {} lists an incomplete chunk set",
                self.backup_id
            )));
        }
        Ok(chunks)
    }
}
