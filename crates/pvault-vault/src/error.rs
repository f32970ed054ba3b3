use pvault_crypto::{CryptoError, PatternError};
use pvault_secrets::SecretsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault is full: {needed} bytes needed, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    /// Unknown file id and failed authentication look the same on purpose.
    #[error("file unavailable")]
    FileUnavailable,

    #[error("the new pattern already opens a vault with content")]
    KeyInUse,

    #[error("invalid pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("crypto: {0}")]
    Crypto(CryptoError),

    #[error("secret store: {0}")]
    Secrets(#[from] SecretsError),

    #[error("vault I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Recovery(Box<RecoveryError>),

    #[error("index encoding: {0}")]
    Encoding(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Pattern(p) => VaultError::Pattern(p),
            other => VaultError::Crypto(other),
        }
    }
}

impl From<RecoveryError> for VaultError {
    fn from(e: RecoveryError) -> Self {
        VaultError::Recovery(Box::new(e))
    }
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no vault matches this recovery phrase")]
    InvalidPhrase,

    #[error("no recovery phrase is registered for this vault")]
    VaultNotFound,

    #[error("this phrase is already in use; choose another")]
    DuplicatePhrase,

    #[error("phrase rejected: {0}")]
    WeakPhrase(String),

    #[error("recovery storage: {0}")]
    Keychain(String),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<SecretsError> for RecoveryError {
    fn from(e: SecretsError) -> Self {
        RecoveryError::Keychain(e.to_string())
    }
}

pub type RecoveryResult<T> = std::result::Result<T, RecoveryError>;

#[derive(Debug, Error)]
pub enum DuressError {
    #[error("a shared vault cannot be the duress vault")]
    SharedVault,

    #[error("duress marker storage: {0}")]
    Secrets(#[from] SecretsError),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

pub type DuressResult<T> = std::result::Result<T, DuressError>;
