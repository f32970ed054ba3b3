use thiserror::Error;

/// Errors from key derivation and AEAD operations.
///
/// Every authentication failure collapses into [`CryptoError::Decrypt`] with
/// no detail, so callers cannot tell a wrong key from a tampered payload.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("system randomness unavailable: {0}")]
    Rng(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed")]
    Decrypt,

    #[error("I/O error during streaming crypto: {0}")]
    Io(#[from] std::io::Error),
}

/// Pattern validator rejections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern has {got} nodes, at least {min} required")]
    TooShort { got: usize, min: usize },

    #[error("node {node} is outside a {grid}x{grid} grid")]
    OutOfRange { node: u8, grid: u8 },

    #[error("node {0} is visited more than once")]
    DuplicateNode(u8),

    #[error("pattern changes direction {got} times, at least {min} required")]
    TooFewDirectionChanges { got: usize, min: usize },

    #[error("unsupported grid size {0} (2..=15)")]
    BadGrid(u8),

    #[error("cannot parse pattern: {0}")]
    Parse(String),
}
