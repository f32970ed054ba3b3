use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration (loaded from pvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PvaultConfig {
    pub vault: VaultConfig,
    pub pattern: PatternConfig,
    pub crypto: CryptoConfig,
    pub recovery: RecoveryConfig,
    pub secrets: SecretsConfig,
    pub backup: BackupConfig,
    pub log: LogConfig,
}

impl PvaultConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding vault blobs, indexes, and backup staging
    pub root: PathBuf,
    /// Preallocated blob size in bytes (default: 50 MiB)
    pub blob_size: u64,
    /// Plaintext bytes per streaming AEAD chunk (default: 256 KiB)
    pub stream_chunk_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Grid is `grid_size` x `grid_size` nodes (default: 5)
    pub grid_size: u8,
    /// Minimum number of nodes in an accepted pattern (default: 6)
    pub min_nodes: usize,
    /// Minimum number of changes in the reduced step direction along the
    /// pattern (default: 1; a straight run with one turn has exactly one)
    pub min_direction_changes: usize,
}

/// Argon2id parameters shared by the vault and backup KDFs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Words in a generated recovery phrase: 12 or 24 (default: 12)
    pub phrase_words: usize,
    /// Minimum words in a user-chosen phrase (default: 6)
    pub min_custom_words: usize,
    /// Minimum distinct words in a user-chosen phrase (default: 5)
    pub min_distinct_words: usize,
    /// Minimum estimated entropy in bits for a user-chosen phrase (default: 55)
    pub min_entropy_bits: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Secret store backend: "keyring" (platform keychain) or "file"
    pub backend: String,
    /// Directory for the file backend
    pub file_dir: PathBuf,
    /// Keychain service name for the keyring backend
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// S3-compatible endpoint for the remote chunk store
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Key prefix inside the bucket (default: "backups")
    pub prefix: String,
    /// Enforce HTTPS for the remote endpoint
    pub enforce_tls: bool,
    /// Upload chunk size in bytes (default: 8 MiB, capped at 50 MiB)
    pub chunk_size: u64,
    /// Per-chunk retry limit for transient failures
    pub max_retries: u32,
    /// Concurrent chunk uploads
    pub upload_concurrency: usize,
    /// Concurrent chunk downloads (default: 4)
    pub download_concurrency: usize,
    /// Backup versions kept remotely per vault; older ones are pruned
    pub keep_versions: usize,
    /// Refuse to back up or restore over metered connections
    pub wifi_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Hard ceiling on a single remote chunk.
pub const MAX_BACKUP_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.local/share/pvault"),
            blob_size: 50 * 1024 * 1024,
            stream_chunk_size: 256 * 1024,
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            grid_size: 5,
            min_nodes: 6,
            min_direction_changes: 1,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            phrase_words: 12,
            min_custom_words: 6,
            min_distinct_words: 5,
            min_entropy_bits: 55.0,
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: "keyring".into(),
            file_dir: PathBuf::from("~/.local/share/pvault/secrets"),
            service: "pvault".into(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "pvault".into(),
            prefix: "backups".into(),
            enforce_tls: false,
            chunk_size: 8 * 1024 * 1024,
            max_retries: 3,
            upload_concurrency: 2,
            download_concurrency: 4,
            keep_versions: 3,
            wifi_only: false,
        }
    }
}

impl BackupConfig {
    /// Chunk size clamped to `1..=MAX_BACKUP_CHUNK_SIZE`.
    pub fn effective_chunk_size(&self) -> u64 {
        self.chunk_size.clamp(1, MAX_BACKUP_CHUNK_SIZE)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
