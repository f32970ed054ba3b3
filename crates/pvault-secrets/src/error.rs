use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("keychain {op} for '{name}': {reason}")]
    Keychain {
        op: &'static str,
        name: String,
        reason: String,
    },

    #[error("secret '{0}' is not valid base64")]
    Encoding(String),

    #[error("unknown secrets backend: {0}")]
    UnknownBackend(String),

    #[error("secret file I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub type SecretsResult<T> = std::result::Result<T, SecretsError>;
