//! Local staging for resumable backups.
//!
//! ```text
//! <root>/staging/{backup_vault_id}/container.enc      encrypted container
//! <root>/staging/{backup_vault_id}/checkpoint.json    uploaded chunks so far
//! <root>/staging/{backup_vault_id}/restore-{id}.enc   download scratch
//! ```
//!
//! The checkpoint is rewritten atomically after every uploaded chunk; an
//! interrupted backup picks up from it on the next run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use pvault_core::fsutil::{atomic_write, remove_if_exists};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::manifest::{BackupChunk, BackupVersionEntry, MANIFEST_VERSION};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub backup_id: String,
    pub created_at: u64,
    pub total_size: u64,
    pub chunk_size: u64,
    pub verification_token: String,
    pub file_count: usize,
    /// BLAKE3 of the packed index; a resume is only valid while the vault
    /// still matches it
    #[serde(default)]
    pub vault_state: String,
    /// Uploaded chunks by index
    #[serde(default)]
    pub uploaded: BTreeMap<u32, BackupChunk>,
}

impl Checkpoint {
    pub fn chunk_count(&self) -> u32 {
        self.total_size.div_ceil(self.chunk_size.max(1)).max(1) as u32
    }

    pub fn pending(&self) -> Vec<u32> {
        (0..self.chunk_count())
            .filter(|i| !self.uploaded.contains_key(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded.len() as u32 == self.chunk_count()
    }

    /// Byte range of chunk `index` within the container.
    pub fn chunk_range(&self, index: u32) -> (u64, u64) {
        let start = u64::from(index) * self.chunk_size;
        let len = self.chunk_size.min(self.total_size.saturating_sub(start));
        (start, len)
    }

    pub fn to_manifest(&self) -> BackupVersionEntry {
        BackupVersionEntry {
            version: MANIFEST_VERSION,
            backup_id: self.backup_id.clone(),
            created_at: self.created_at,
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            chunks: self.uploaded.values().cloned().collect(),
            verification_token: self.verification_token.clone(),
            file_count: self.file_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, backup_vault_id: &str) -> PathBuf {
        self.root.join(backup_vault_id)
    }

    pub fn container_path(&self, backup_vault_id: &str) -> PathBuf {
        self.dir(backup_vault_id).join("container.enc")
    }

    pub fn checkpoint_path(&self, backup_vault_id: &str) -> PathBuf {
        self.dir(backup_vault_id).join("checkpoint.json")
    }

    pub fn download_path(&self, backup_vault_id: &str, backup_id: &str) -> PathBuf {
        self.dir(backup_vault_id).join(format!("restore-{backup_id}.enc"))
    }

    pub fn ensure_dir(&self, backup_vault_id: &str) -> anyhow::Result<PathBuf> {
        let dir = self.dir(backup_vault_id);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating staging dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// A checkpoint whose container is still on disk with the recorded size.
    pub fn resumable(&self, backup_vault_id: &str) -> Option<Checkpoint> {
        let path = self.checkpoint_path(backup_vault_id);
        let content = std::fs::read(&path).ok()?;
        let checkpoint: Checkpoint = match serde_json::from_slice(&content) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable checkpoint");
                return None;
            }
        };
        let container_len = std::fs::metadata(self.container_path(backup_vault_id)).ok()?.len();
        (container_len == checkpoint.total_size).then_some(checkpoint)
    }

    pub fn save_checkpoint(&self, backup_vault_id: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let path = self.checkpoint_path(backup_vault_id);
        let json = serde_json::to_vec_pretty(checkpoint).context("serializing checkpoint")?;
        atomic_write(&path, &json).with_context(|| format!("writing checkpoint: {}", path.display()))?;
        Ok(())
    }

    /// Remove a vault's staging directory.
    pub fn clear(&self, backup_vault_id: &str) {
        let dir = self.dir(backup_vault_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!(dir = %dir.display(), "staging cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "could not clear staging"),
        }
    }

    pub fn remove_file(&self, path: &Path) {
        if let Err(e) = remove_if_exists(path) {
            warn!(path = %path.display(), error = %e, "could not remove staging file");
        }
    }
}
