//! Backup engine: pack a vault into an encrypted container, upload it as
//! fixed-size chunks, and restore it on any device that knows the pattern.
//!
//! Remote layout under the configured prefix:
//!
//! ```text
//! {backup_vault_id}/{backup_id}/chunk-000000
//! {backup_vault_id}/{backup_id}/chunk-000001
//! {backup_vault_id}/{backup_id}/manifest.json   written last
//! ```
//!
//! `backup_vault_id` comes from the fixed-salt backup key, so the same
//! pattern finds its backups from a fresh install.

use std::collections::BTreeMap;
use std::fs::File;
use std::future::Future;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pvault_core::config::BackupConfig;
use pvault_core::fsutil::temp_path;
use pvault_core::types::BackupStage;
use pvault_crypto::{
    decrypt_stream, encrypt_stream, verification_token, verify_token, CryptoError, KeyDeriver, Pattern, VaultKey,
};
use pvault_storage::{RemoteStore, StorageError, StorageResult};
use pvault_vault::{VaultIndex, VaultStorage};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::{container_reader, stream_context, ContainerSink};
use crate::error::{BackupError, BackupResult};
use crate::manifest::{BackupChunk, BackupVersionEntry};
use crate::probe::{check_policy, ConnectionKind, NetworkProbe, StaticProbe};
use crate::staging::{Checkpoint, StagingArea};

const BACKUP_ID_DOMAIN: &[u8] = b"pvault-backup-id";
const MANIFEST_NAME: &str = "manifest.json";
/// Hard cap on chunks held in memory during a restore
const MAX_DOWNLOADS_IN_FLIGHT: usize = 4;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Outcome of a successful restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub backup_id: String,
    pub file_count: usize,
    /// Blob bytes restored (the used region, before padding)
    pub bytes: u64,
}

pub struct BackupManager {
    storage: Arc<VaultStorage>,
    remote: RemoteStore,
    deriver: KeyDeriver,
    config: BackupConfig,
    staging: StagingArea,
    probe: Arc<dyn NetworkProbe>,
    progress: watch::Sender<BackupStage>,
}

impl BackupManager {
    pub fn new(
        storage: Arc<VaultStorage>,
        remote: RemoteStore,
        deriver: KeyDeriver,
        config: BackupConfig,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        let (progress, _) = watch::channel(BackupStage::Idle);
        Self {
            storage,
            remote,
            deriver,
            config,
            staging: StagingArea::new(staging_root),
            probe: Arc::new(StaticProbe(ConnectionKind::Unknown)),
            progress,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<BackupStage> {
        self.progress.subscribe()
    }

    pub fn stage(&self) -> BackupStage {
        self.progress.borrow().clone()
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    fn set_stage(&self, stage: BackupStage) {
        self.progress.send_replace(stage);
    }

    fn finish_stage<T>(&self, result: &BackupResult<T>) {
        match result {
            Ok(_) => self.set_stage(BackupStage::Complete),
            Err(e) => self.set_stage(BackupStage::Failed { reason: e.to_string() }),
        }
    }

    /// Remote directory name for a backup key.
    pub fn backup_vault_id(backup_key: &VaultKey) -> BackupResult<String> {
        Ok(backup_key.derive_id(BACKUP_ID_DOMAIN)?)
    }

    /// Run the fixed-salt KDF off the async runtime.
    pub async fn derive_backup_key(&self, pattern: Pattern) -> BackupResult<VaultKey> {
        let deriver = self.deriver.clone();
        let key = tokio::task::spawn_blocking(move || deriver.derive_backup(&pattern))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))??;
        Ok(key)
    }

    /// Back up the vault addressed by `vault_key`. An interrupted run for the
    /// same pattern resumes from its staged container, unless the vault has
    /// changed since, in which case it is repacked under a new backup id.
    pub async fn perform_backup(
        &self,
        vault_key: &VaultKey,
        pattern: &Pattern,
        cancel: &CancellationToken,
    ) -> BackupResult<BackupVersionEntry> {
        let result = self.run_backup(vault_key, pattern, cancel).await;
        self.finish_stage(&result);
        if let Err(e) = &result {
            warn!(error = %e, "backup did not complete");
        }
        result
    }

    async fn run_backup(
        &self,
        vault_key: &VaultKey,
        pattern: &Pattern,
        cancel: &CancellationToken,
    ) -> BackupResult<BackupVersionEntry> {
        check_policy(self.probe.as_ref(), self.config.wifi_only)?;

        self.set_stage(BackupStage::Deriving);
        let backup_key = self.derive_backup_key(pattern.clone()).await?;
        let bvid = Self::backup_vault_id(&backup_key)?;
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        self.set_stage(BackupStage::Packing);
        let checkpoint = match self.resumable(vault_key, &bvid).await? {
            Some(checkpoint) => {
                info!(
                    backup = %checkpoint.backup_id,
                    uploaded = checkpoint.uploaded.len(),
                    total = checkpoint.chunk_count(),
                    "resuming staged backup"
                );
                checkpoint
            }
            None => self.pack(vault_key, &backup_key, &bvid).await?,
        };

        let checkpoint = self.upload(&bvid, checkpoint, cancel).await?;

        self.set_stage(BackupStage::Finalizing);
        let manifest = checkpoint.to_manifest();
        let bytes = manifest.to_bytes()?;
        let key = manifest_key(&bvid, &manifest.backup_id);
        with_retry(self.config.max_retries, &key, || self.remote.put(&key, bytes.clone())).await?;

        match self.prune(&bvid, &manifest.backup_id).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "pruned old backup objects"),
            Err(e) => warn!(error = %e, "pruning old backups failed"),
        }
        self.staging.clear(&bvid);

        info!(
            backup = %manifest.backup_id,
            chunks = manifest.chunks.len(),
            bytes = manifest.total_size,
            files = manifest.file_count,
            "backup complete"
        );
        Ok(manifest)
    }

    /// The staged checkpoint, if there is one and the vault has not changed
    /// since it was packed. A stale one is discarded.
    async fn resumable(&self, vault_key: &VaultKey, bvid: &str) -> BackupResult<Option<Checkpoint>> {
        let Some(checkpoint) = self.staging.resumable(bvid) else {
            return Ok(None);
        };
        let storage = self.storage.clone();
        let vault_key = vault_key.clone();
        let current = tokio::task::spawn_blocking(move || -> BackupResult<String> {
            vault_state(&storage.load_index(&vault_key)?)
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))??;

        if checkpoint.vault_state != current {
            info!(
                backup = %checkpoint.backup_id,
                "vault changed since the interrupted backup, repacking"
            );
            self.staging.clear(bvid);
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    /// Snapshot and encrypt the vault into the staging container.
    async fn pack(&self, vault_key: &VaultKey, backup_key: &VaultKey, bvid: &str) -> BackupResult<Checkpoint> {
        let storage = self.storage.clone();
        let staging = self.staging.clone();
        let vault_key = vault_key.clone();
        let backup_key = backup_key.clone();
        let bvid = bvid.to_string();
        let chunk_size = self.config.effective_chunk_size();

        tokio::task::spawn_blocking(move || -> BackupResult<Checkpoint> {
            staging.ensure_dir(&bvid)?;
            let snapshot = storage.snapshot(&vault_key)?;
            let file_count = snapshot.index.live_files().count();
            let state = vault_state(&snapshot.index)?;

            // the copy travels wrapped under the backup key
            let mut index = snapshot.index.clone();
            index.set_master_key(&snapshot.master, &backup_key)?;
            let index_json = index.to_json()?;

            let backup_id = Uuid::new_v4().to_string();
            let path = staging.container_path(&bvid);
            let tmp = temp_path(&path);
            let mut writer = BufWriter::new(File::create(&tmp)?);
            let mut reader = container_reader(&index_json, (&snapshot.blob).take(snapshot.used))?;
            let total_size = encrypt_stream(
                &backup_key,
                &stream_context(&backup_id),
                &mut reader,
                &mut writer,
                storage.stream_chunk_size(),
            )?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)?;

            let checkpoint = Checkpoint {
                verification_token: verification_token(&backup_key, &backup_id)?,
                backup_id,
                created_at: unix_millis(),
                total_size,
                chunk_size,
                file_count,
                vault_state: state,
                uploaded: BTreeMap::new(),
            };
            staging.save_checkpoint(&bvid, &checkpoint)?;
            debug!(backup = %checkpoint.backup_id, bytes = total_size, "container packed");
            Ok(checkpoint)
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))?
    }

    async fn upload(
        &self,
        bvid: &str,
        mut checkpoint: Checkpoint,
        cancel: &CancellationToken,
    ) -> BackupResult<Checkpoint> {
        let total = u64::from(checkpoint.chunk_count());
        let container = self.staging.container_path(bvid);
        let jobs: Vec<(u32, u64, u64, String)> = checkpoint
            .pending()
            .into_iter()
            .map(|index| {
                let (offset, len) = checkpoint.chunk_range(index);
                (index, offset, len, chunk_key(bvid, &checkpoint.backup_id, index))
            })
            .collect();

        self.set_stage(BackupStage::Uploading {
            done: checkpoint.uploaded.len() as u64,
            total,
        });

        let container = container.as_path();
        let mut uploads = pin!(futures::stream::iter(jobs)
            .map(|(index, offset, len, key)| async move {
                self.upload_chunk(container, &key, index, offset, len).await
            })
            .buffer_unordered(self.config.upload_concurrency.max(1)));

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(
                        backup = %checkpoint.backup_id,
                        uploaded = checkpoint.uploaded.len(),
                        "backup cancelled, staging kept for resume"
                    );
                    return Err(BackupError::Cancelled);
                }
                next = uploads.next() => next,
            };
            let Some(result) = next else { break };
            let chunk = result?;
            checkpoint.uploaded.insert(chunk.index, chunk);
            self.staging.save_checkpoint(bvid, &checkpoint)?;
            self.set_stage(BackupStage::Uploading {
                done: checkpoint.uploaded.len() as u64,
                total,
            });
        }
        Ok(checkpoint)
    }

    async fn upload_chunk(&self, container: &Path, key: &str, index: u32, offset: u64, len: u64) -> BackupResult<BackupChunk> {
        let data = read_range(container, offset, len).await?;
        let hash = blake3::hash(&data).to_hex().to_string();
        with_retry(self.config.max_retries, key, || self.remote.put(key, data.clone())).await?;
        debug!(chunk = index, bytes = len, "chunk uploaded");
        Ok(BackupChunk { index, hash, size: len })
    }

    /// Completed backups for this key, newest first.
    pub async fn list_versions(&self, backup_key: &VaultKey) -> BackupResult<Vec<BackupVersionEntry>> {
        let bvid = Self::backup_vault_id(backup_key)?;
        Ok(self.scan(&bvid).await?.0)
    }

    pub async fn latest_version(&self, backup_key: &VaultKey) -> BackupResult<Option<BackupVersionEntry>> {
        Ok(self.list_versions(backup_key).await?.into_iter().next())
    }

    /// Remove one backup version. Returns the number of objects deleted.
    pub async fn delete_version(&self, backup_key: &VaultKey, backup_id: &str) -> BackupResult<usize> {
        let bvid = Self::backup_vault_id(backup_key)?;
        let removed = self.remote.delete_prefix(&format!("{bvid}/{backup_id}")).await?;
        info!(backup = backup_id, removed, "backup version deleted");
        Ok(removed)
    }

    /// Cheap pattern check against a manifest, before any chunk is fetched.
    pub fn verify_pattern_before_download(&self, backup_key: &VaultKey, entry: &BackupVersionEntry) -> bool {
        verify_token(backup_key, &entry.backup_id, &entry.verification_token)
    }

    /// Manifests under `bvid` (newest first) and ids of directories that
    /// never got one.
    async fn scan(&self, bvid: &str) -> BackupResult<(Vec<BackupVersionEntry>, Vec<String>)> {
        let mut versions = Vec::new();
        let mut incomplete = Vec::new();
        for name in self.remote.list(bvid).await? {
            let Some(backup_id) = name.strip_suffix('/') else {
                continue;
            };
            match self.remote.get(&manifest_key(bvid, backup_id)).await {
                Ok(bytes) => match BackupVersionEntry::from_bytes(&bytes) {
                    Ok(entry) => versions.push(entry),
                    Err(e) => warn!(backup = backup_id, error = %e, "skipping unreadable manifest"),
                },
                Err(StorageError::NotFound(_)) => incomplete.push(backup_id.to_string()),
                Err(e) => return Err(e.into()),
            }
        }
        versions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok((versions, incomplete))
    }

    /// Drop versions beyond `keep_versions` and leftovers of abandoned runs.
    async fn prune(&self, bvid: &str, current: &str) -> BackupResult<usize> {
        let (versions, incomplete) = self.scan(bvid).await?;
        let keep = self.config.keep_versions.max(1);
        let mut removed = 0;
        let stale = versions
            .iter()
            .skip(keep)
            .map(|v| v.backup_id.as_str())
            .chain(incomplete.iter().map(String::as_str))
            .filter(|id| *id != current);
        for backup_id in stale {
            removed += self.remote.delete_prefix(&format!("{bvid}/{backup_id}")).await?;
        }
        Ok(removed)
    }

    /// Restore the latest backup for `backup_key` into the vault addressed by
    /// `vault_key`. The local vault is only replaced once the whole container
    /// has downloaded and authenticated.
    pub async fn restore_backup(
        &self,
        backup_key: &VaultKey,
        vault_key: &VaultKey,
        cancel: &CancellationToken,
    ) -> BackupResult<RestoreSummary> {
        let result = self.run_restore(backup_key, vault_key, cancel).await;
        self.finish_stage(&result);
        if let Err(e) = &result {
            warn!(error = %e, "restore did not complete");
        }
        result
    }

    async fn run_restore(
        &self,
        backup_key: &VaultKey,
        vault_key: &VaultKey,
        cancel: &CancellationToken,
    ) -> BackupResult<RestoreSummary> {
        check_policy(self.probe.as_ref(), self.config.wifi_only)?;
        let bvid = Self::backup_vault_id(backup_key)?;

        let entry = self
            .latest_version(backup_key)
            .await?
            .ok_or_else(|| BackupError::NotAvailable("no backup found for this pattern".into()))?;
        if !self.verify_pattern_before_download(backup_key, &entry) {
            return Err(BackupError::ChecksumMismatch);
        }
        let chunks = entry.ordered_chunks()?;

        self.staging.ensure_dir(&bvid)?;
        let scratch = self.staging.download_path(&bvid, &entry.backup_id);
        if let Err(e) = self.download(&bvid, &entry, chunks, &scratch, cancel).await {
            self.staging.remove_file(&scratch);
            return Err(e);
        }

        self.set_stage(BackupStage::Finalizing);
        let result = self.unpack(backup_key, vault_key, &entry, &scratch).await;
        self.staging.remove_file(&scratch);
        let summary = result?;
        info!(
            backup = %summary.backup_id,
            files = summary.file_count,
            bytes = summary.bytes,
            "restore complete"
        );
        Ok(summary)
    }

    /// Fetch chunks in order into `scratch`, verifying each one.
    async fn download(
        &self,
        bvid: &str,
        entry: &BackupVersionEntry,
        chunks: Vec<BackupChunk>,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> BackupResult<()> {
        let total = chunks.len() as u64;
        self.set_stage(BackupStage::Downloading { done: 0, total });

        let mut file = tokio::fs::File::create(scratch).await?;
        let in_flight = self.config.download_concurrency.clamp(1, MAX_DOWNLOADS_IN_FLIGHT);
        let mut fetches = pin!(futures::stream::iter(chunks)
            .map(|chunk| {
                let key = chunk_key(bvid, &entry.backup_id, chunk.index);
                async move { self.download_chunk(&key, &chunk).await }
            })
            .buffered(in_flight));

        let mut done = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                next = fetches.next() => next,
            };
            let Some(result) = next else { break };
            file.write_all(&result?).await?;
            done += 1;
            self.set_stage(BackupStage::Downloading { done, total });
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn download_chunk(&self, key: &str, chunk: &BackupChunk) -> BackupResult<Vec<u8>> {
        let data = with_retry(self.config.max_retries, key, || self.remote.get(key))
            .await
            .map_err(|e| BackupError::DownloadFailed(e.to_string()))?;
        if data.len() as u64 != chunk.size || blake3::hash(&data).to_hex().as_str() != chunk.hash {
            return Err(BackupError::DownloadFailed(format!(
                "chunk {} failed integrity check",
                chunk.index
            )));
        }
        Ok(data)
    }

    /// Decrypt the downloaded container into a restore target and commit it.
    async fn unpack(
        &self,
        backup_key: &VaultKey,
        vault_key: &VaultKey,
        entry: &BackupVersionEntry,
        scratch: &Path,
    ) -> BackupResult<RestoreSummary> {
        let storage = self.storage.clone();
        let backup_key = backup_key.clone();
        let vault_key = vault_key.clone();
        let backup_id = entry.backup_id.clone();
        let total_size = entry.total_size;
        let scratch = scratch.to_path_buf();

        tokio::task::spawn_blocking(move || -> BackupResult<RestoreSummary> {
            let target = storage.begin_restore(&vault_key)?;
            let opened = (|| -> BackupResult<(VaultIndex, pvault_crypto::MasterKey, u64)> {
                let mut reader = BufReader::new(File::open(&scratch)?);
                let mut sink = ContainerSink::new(BufWriter::new(File::create(target.path())?));
                decrypt_stream(&backup_key, &stream_context(&backup_id), &mut reader, &mut sink, total_size)
                    .map_err(map_decrypt_err)?;
                let (index_json, blob, written) = sink.finish().map_err(|_| BackupError::ChecksumMismatch)?;
                blob.into_inner().map_err(|e| e.into_error())?.sync_all()?;

                let index = VaultIndex::from_json(&index_json).map_err(|_| BackupError::ChecksumMismatch)?;
                let master = index.master_key(&backup_key).map_err(|_| BackupError::ChecksumMismatch)?;
                Ok((index, master, written))
            })();

            let (index, master, bytes) = match opened {
                Ok(parts) => parts,
                Err(e) => {
                    storage.abort_restore(target);
                    return Err(e);
                }
            };
            let file_count = index.live_files().count();
            storage.commit_restore(&vault_key, target, index, &master)?;
            Ok(RestoreSummary {
                backup_id,
                file_count,
                bytes,
            })
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))?
    }
}

fn chunk_key(bvid: &str, backup_id: &str, index: u32) -> String {
    format!("{bvid}/{backup_id}/chunk-{index:06}")
}

fn manifest_key(bvid: &str, backup_id: &str) -> String {
    format!("{bvid}/{backup_id}/{MANIFEST_NAME}")
}

/// Authentication failures and malformed plaintext mean a wrong key or a
/// tampered container; only genuine local I/O stays an I/O error.
fn map_decrypt_err(e: CryptoError) -> BackupError {
    match e {
        CryptoError::Io(io) if io.kind() != std::io::ErrorKind::InvalidData => BackupError::Io(io),
        _ => BackupError::ChecksumMismatch,
    }
}

async fn read_range(path: &Path, offset: u64, len: u64) -> BackupResult<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> BackupResult<Vec<u8>> {
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    })
    .await
    .map_err(|e| BackupError::Task(e.to_string()))?
}

/// Retry transient store failures with exponential backoff.
async fn with_retry<T, F, Fut>(max_retries: u32, what: &str, mut op: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                attempt += 1;
                warn!(key = what, attempt, error = %e, "transient store error, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Identity of a vault's contents: changes whenever its index does.
fn vault_state(index: &VaultIndex) -> BackupResult<String> {
    Ok(blake3::hash(&index.to_json()?).to_hex().to_string())
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvault_crypto::{KdfParams, PatternRules};
    use pvault_storage::memory_operator;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> BackupManager {
        let storage = Arc::new(VaultStorage::with_params(&tmp.path().join("vault"), 64 * 1024, 4096).unwrap());
        let deriver = KeyDeriver::new(
            [3u8; 16],
            KdfParams {
                mem_cost_kib: 1024,
                time_cost: 1,
                parallelism: 1,
            },
            PatternRules::default(),
        );
        let config = BackupConfig {
            chunk_size: 4096,
            ..BackupConfig::default()
        };
        let remote = RemoteStore::new(memory_operator().unwrap(), "backups");
        BackupManager::new(storage, remote, deriver, config, tmp.path().join("staging"))
    }

    fn pattern() -> Pattern {
        Pattern::new(5, vec![0, 6, 12, 18, 24, 20])
    }

    #[tokio::test]
    async fn test_interrupted_upload_resumes_same_backup() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let vault_key = VaultKey::from_bytes([1; 32]);
        mgr.storage.store_file(&[7u8; 20_000], "a.bin", "x", &vault_key).unwrap();

        let backup_key = mgr.derive_backup_key(pattern()).await.unwrap();
        let bvid = BackupManager::backup_vault_id(&backup_key).unwrap();
        let packed = mgr.pack(&vault_key, &backup_key, &bvid).await.unwrap();
        assert!(packed.chunk_count() > 2);

        // a cancelled upload keeps its staging
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = mgr.upload(&bvid, packed.clone(), &cancel).await.unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        assert!(mgr.staging.resumable(&bvid).is_some());

        // first chunk made it out before the interruption
        let (offset, len) = packed.chunk_range(0);
        let container = mgr.staging.container_path(&bvid);
        let first = mgr
            .upload_chunk(&container, &chunk_key(&bvid, &packed.backup_id, 0), 0, offset, len)
            .await
            .unwrap();
        let mut partial = packed.clone();
        partial.uploaded.insert(0, first);
        mgr.staging.save_checkpoint(&bvid, &partial).unwrap();

        let entry = mgr
            .perform_backup(&vault_key, &pattern(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(entry.backup_id, packed.backup_id);
        assert_eq!(entry.chunks.len() as u32, packed.chunk_count());
        assert_eq!(entry.file_count, 1);
        assert!(mgr.staging.resumable(&bvid).is_none());
        assert_eq!(mgr.stage(), BackupStage::Complete);
    }

    #[tokio::test]
    async fn test_vault_change_discards_staged_backup() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let vault_key = VaultKey::from_bytes([1; 32]);
        mgr.storage.store_file(&[7u8; 10_000], "a.bin", "x", &vault_key).unwrap();

        let backup_key = mgr.derive_backup_key(pattern()).await.unwrap();
        let bvid = BackupManager::backup_vault_id(&backup_key).unwrap();
        let packed = mgr.pack(&vault_key, &backup_key, &bvid).await.unwrap();
        assert!(mgr.resumable(&vault_key, &bvid).await.unwrap().is_some());

        let late = mgr.storage.store_file(b"added after", "late.txt", "text/plain", &vault_key).unwrap();
        assert!(mgr.resumable(&vault_key, &bvid).await.unwrap().is_none());

        let entry = mgr
            .perform_backup(&vault_key, &pattern(), &CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(entry.backup_id, packed.backup_id);
        assert_eq!(entry.file_count, 2);

        let fresh = VaultKey::from_bytes([2; 32]);
        mgr.restore_backup(&backup_key, &fresh, &CancellationToken::new())
            .await
            .unwrap();
        let (_, plain) = mgr.storage.retrieve_file(&late, &fresh).unwrap();
        assert_eq!(plain.as_slice(), b"added after");
    }

    #[tokio::test]
    async fn test_cancel_before_packing() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = mgr
            .perform_backup(&VaultKey::from_bytes([1; 32]), &pattern(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        assert!(matches!(mgr.stage(), BackupStage::Failed { .. }));
    }

    #[test]
    fn test_remote_keys() {
        assert_eq!(chunk_key("v", "b", 7), "v/b/chunk-000007");
        assert_eq!(manifest_key("v", "b"), "v/b/manifest.json");
    }

    #[test]
    fn test_decrypt_error_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(map_decrypt_err(CryptoError::Io(io)), BackupError::Io(_)));

        let bad = std::io::Error::new(std::io::ErrorKind::InvalidData, "not a backup container");
        assert!(matches!(map_decrypt_err(CryptoError::Io(bad)), BackupError::ChecksumMismatch));
        assert!(matches!(map_decrypt_err(CryptoError::Decrypt), BackupError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_errors() {
        let mut calls = 0;
        let result: StorageResult<()> = with_retry(3, "k", || {
            calls += 1;
            async {
                Err(StorageError::Permanent {
                    key: "k".into(),
                    reason: "denied".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let mut calls = 0;
        let result = with_retry(3, "k", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(StorageError::Transient {
                        key: "k".into(),
                        reason: "timeout".into(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
