use thiserror::Error;

pub type PvaultResult<T> = Result<T, PvaultError>;

/// Umbrella error for callers that drive several pvault subsystems at once.
///
/// Each library crate keeps its own typed error; this enum only carries them
/// across the boundary as display strings so `pvault-core` stays a leaf.
#[derive(Debug, Error)]
pub enum PvaultError {
    #[error("vault error: {0}")]
    Vault(String),

    #[error("recovery error: {0}")]
    Recovery(String),

    #[error("secrets error: {0}")]
    Secrets(String),

    #[error("backup error: {0}")]
    Backup(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
