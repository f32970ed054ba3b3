//! OpenDAL Operator factory for the backup chunk store

use opendal::Operator;
use pvault_core::config::BackupConfig;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{StorageError, StorageResult};

/// Credentials for the S3-compatible endpoint, read from the environment
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

impl S3Credentials {
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`, falling back to the
    /// `PVAULT_S3_*` pair.
    pub fn from_env() -> Option<Self> {
        let access = std::env::var("AWS_ACCESS_KEY_ID")
            .or_else(|_| std::env::var("PVAULT_S3_ACCESS_KEY"))
            .ok()?;
        let secret = std::env::var("AWS_SECRET_ACCESS_KEY")
            .or_else(|_| std::env::var("PVAULT_S3_SECRET_KEY"))
            .ok()?;
        Some(Self {
            access_key_id: access,
            secret_access_key: SecretString::from(secret),
        })
    }
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build an OpenDAL Operator for any S3-compatible endpoint.
///
/// Uses path-style addressing (default in opendal 0.55), which MinIO and most
/// self-hosted S3 gateways require.
///
/// If `enforce_tls` is set and the endpoint uses HTTP this fails; otherwise a
/// plaintext endpoint only logs a warning. Chunks are encrypted before upload
/// either way; TLS protects the credentials.
pub fn build_operator(cfg: &BackupConfig, creds: &S3Credentials) -> StorageResult<Operator> {
    if cfg.endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            return Err(StorageError::Config(format!(
                "backup endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set backup.enforce_tls = false for local development.",
                cfg.endpoint
            )));
        }
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "backup endpoint uses plaintext HTTP, credentials are transmitted unencrypted"
        );
    }

    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&creds.access_key_id)
        .secret_access_key(creds.secret_access_key.expose_secret());

    let op = Operator::new(builder)
        .map_err(|e| StorageError::Config(format!("creating OpenDAL S3 operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(cfg.max_retries as usize)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// In-memory operator: tests and dry runs.
pub fn memory_operator() -> StorageResult<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .map_err(|e| StorageError::Config(format!("creating memory operator: {e}")))?
        .finish())
}
