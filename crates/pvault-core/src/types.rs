use serde::{Deserialize, Serialize};

/// Progress of a backup or restore run, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStage {
    Idle,
    /// Running the (slow) fixed-salt KDF for the backup key
    Deriving,
    /// Snapshotting and encrypting the vault into local staging
    Packing,
    Uploading { done: u64, total: u64 },
    Downloading { done: u64, total: u64 },
    /// Writing the manifest (backup) or swapping local files (restore)
    Finalizing,
    Complete,
    Failed { reason: String },
}

impl BackupStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStage::Complete | BackupStage::Failed { .. })
    }
}

/// Space accounting for one vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStats {
    /// Preallocated blob size in bytes
    pub capacity: u64,
    /// Bytes consumed by appended ciphertext, including deleted regions
    pub used: u64,
    /// Live (non-deleted) file count
    pub files: usize,
    /// Deleted entries whose blob region is still occupied
    pub deleted: usize,
}

impl VaultStats {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Seconds since the Unix epoch, 0 if the clock is before 1970.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
