use pvault_crypto::CryptoError;
use pvault_storage::StorageError;
use pvault_vault::VaultError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    /// Remote store unreachable, or nothing to restore
    #[error("backup not available: {0}")]
    NotAvailable(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// Wrong pattern, or the backup was tampered with. Never retried.
    #[error("backup does not match this pattern or is corrupted")]
    ChecksumMismatch,

    #[error("backups are restricted to Wi-Fi")]
    WifiRequired,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("backup I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("staging: {0:#}")]
    Staging(#[from] anyhow::Error),

    #[error("backup encoding: {0}")]
    Encoding(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<StorageError> for BackupError {
    fn from(e: StorageError) -> Self {
        BackupError::NotAvailable(e.to_string())
    }
}

pub type BackupResult<T> = std::result::Result<T, BackupError>;
