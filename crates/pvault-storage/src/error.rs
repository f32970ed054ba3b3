use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// Timeouts, throttling, connection resets: worth retrying
    #[error("transient storage failure on {key}: {reason}")]
    Transient { key: String, reason: String },

    #[error("storage failure on {key}: {reason}")]
    Permanent { key: String, reason: String },

    #[error("storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient { .. })
    }

    pub(crate) fn from_opendal(key: &str, err: opendal::Error) -> Self {
        if err.kind() == opendal::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else if err.is_temporary() {
            StorageError::Transient {
                key: key.to_string(),
                reason: err.to_string(),
            }
        } else {
            StorageError::Permanent {
                key: key.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
