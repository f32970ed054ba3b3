//! Key/value chunk store on top of an OpenDAL operator.
//!
//! Keys are `/`-separated and relative to the store prefix, e.g.
//! `{backup_vault_id}/{backup_id}/chunk-000003`.

use opendal::{EntryMode, Operator};

use crate::error::{StorageError, StorageResult};

#[derive(Clone, Debug)]
pub struct RemoteStore {
    op: Operator,
    prefix: String,
}

impl RemoteStore {
    pub fn new(op: Operator, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        Self {
            op,
            prefix: if prefix.is_empty() {
                String::new()
            } else {
                format!("{prefix}/")
            },
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    fn full(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.trim_start_matches('/'))
    }

    fn dir(&self, key: &str) -> String {
        let trimmed = key.trim_matches('/');
        if trimmed.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}{trimmed}/", self.prefix)
        }
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let path = self.full(key);
        self.op
            .write(&path, data)
            .await
            .map_err(|e| StorageError::from_opendal(&path, e))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.full(key);
        let buf = self
            .op
            .read(&path)
            .await
            .map_err(|e| StorageError::from_opendal(&path, e))?;
        Ok(buf.to_vec())
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.full(key);
        self.op
            .exists(&path)
            .await
            .map_err(|e| StorageError::from_opendal(&path, e))
    }

    /// Delete one object; deleting a missing object succeeds.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.full(key);
        match self.op.delete(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_opendal(&path, e)),
        }
    }

    /// Immediate children of `dir`, names only. Sub-directories end in `/`.
    pub async fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        let path = self.dir(dir);
        let entries = match self.op.list(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::from_opendal(&path, e)),
        };
        let mut names: Vec<String> = entries
            .into_iter()
            .filter(|e| e.path() != path)
            .map(|e| e.name().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Delete every object under `dir`. Returns the number removed.
    pub async fn delete_prefix(&self, dir: &str) -> StorageResult<usize> {
        let path = self.dir(dir);
        let entries = match self.op.list_with(&path).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::from_opendal(&path, e)),
        };
        let mut removed = 0;
        for entry in entries {
            if entry.metadata().mode() != EntryMode::FILE {
                continue;
            }
            match self.op.delete(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::from_opendal(entry.path(), e)),
            }
        }
        tracing::debug!(prefix = %path, removed, "deleted remote prefix");
        Ok(removed)
    }
}
