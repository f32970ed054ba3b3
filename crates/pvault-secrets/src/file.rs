//! File-backed secret store for hosts without a usable keychain.
//!
//! One file per item under a private directory, replaced atomically.

use std::path::{Path, PathBuf};

use pvault_core::fsutil::{atomic_write, remove_if_exists};
use zeroize::Zeroizing;

use crate::error::SecretsResult;
use crate::store::SecretStore;

#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn open(dir: &Path) -> SecretsResult<Self> {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn item_path(&self, name: &str) -> PathBuf {
        // item names are fixed identifiers; keep them filesystem-safe anyway
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.secret"))
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, name: &str) -> SecretsResult<Option<Zeroizing<Vec<u8>>>> {
        match std::fs::read(self.item_path(name)) {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, name: &str, value: &[u8]) -> SecretsResult<()> {
        let path = self.item_path(name);
        atomic_write(&path, value)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::debug!(key = name, "stored secret in file store");
        Ok(())
    }

    fn delete(&self, name: &str) -> SecretsResult<()> {
        if remove_if_exists(&self.item_path(name))? {
            tracing::debug!(key = name, "deleted secret from file store");
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}
