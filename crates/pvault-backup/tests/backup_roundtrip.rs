//! Backup and restore against an in-memory OpenDAL store, across devices
//! with different local salts.

use std::sync::Arc;

use pvault_backup::{BackupError, BackupManager, ConnectionKind, StaticProbe};
use pvault_core::config::BackupConfig;
use pvault_core::types::BackupStage;
use pvault_crypto::{KdfParams, KeyDeriver, Pattern, PatternRules, VaultKey};
use pvault_storage::{memory_operator, RemoteStore};
use pvault_vault::VaultStorage;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Device {
    _tmp: TempDir,
    storage: Arc<VaultStorage>,
    deriver: KeyDeriver,
    backups: BackupManager,
}

impl Device {
    async fn vault_key(&self, pattern: &Pattern) -> VaultKey {
        self.deriver.derive(pattern).unwrap()
    }
}

fn config() -> BackupConfig {
    BackupConfig {
        chunk_size: 16 * 1024,
        ..BackupConfig::default()
    }
}

fn device(salt: u8, remote: &RemoteStore, config: BackupConfig) -> Device {
    let tmp = TempDir::new().unwrap();
    let storage = Arc::new(VaultStorage::with_params(&tmp.path().join("vault"), 256 * 1024, 8192).unwrap());
    let deriver = KeyDeriver::new(
        [salt; 16],
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        },
        PatternRules::default(),
    );
    let backups = BackupManager::new(
        storage.clone(),
        remote.clone(),
        deriver.clone(),
        config,
        tmp.path().join("staging"),
    );
    Device {
        _tmp: tmp,
        storage,
        deriver,
        backups,
    }
}

fn remote() -> RemoteStore {
    RemoteStore::new(memory_operator().unwrap(), "backups")
}

fn pattern_a() -> Pattern {
    Pattern::new(5, vec![0, 6, 12, 18, 24, 20])
}

fn pattern_b() -> Pattern {
    Pattern::new(5, vec![4, 8, 12, 16, 20, 24])
}

fn payload(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 7 % 253) as u8).collect()
}

/// Rewrite the latest manifest of `pattern`'s backups through `edit`.
async fn edit_manifest(dev: &Device, remote: &RemoteStore, pattern: &Pattern, edit: impl FnOnce(&mut serde_json::Value)) {
    let backup_key = dev.backups.derive_backup_key(pattern.clone()).await.unwrap();
    let bvid = BackupManager::backup_vault_id(&backup_key).unwrap();
    let entry = dev.backups.latest_version(&backup_key).await.unwrap().unwrap();
    let key = format!("{bvid}/{}/manifest.json", entry.backup_id);
    let mut json: serde_json::Value = serde_json::from_slice(&remote.get(&key).await.unwrap()).unwrap();
    edit(&mut json);
    remote.put(&key, serde_json::to_vec(&json).unwrap()).await.unwrap();
}

/// A backup made on one device restores on another that only shares the
/// pattern.
#[tokio::test]
async fn restore_on_fresh_device() {
    let remote = remote();
    let phone = device(1, &remote, config());
    let key = phone.vault_key(&pattern_a()).await;
    let photo = payload(100_000);
    let photo_id = phone.storage.store_file(&photo, "photo.jpg", "image/jpeg", &key).unwrap();
    phone.storage.store_file(b"note", "note.txt", "text/plain", &key).unwrap();

    let progress = phone.backups.subscribe();
    let entry = phone
        .backups
        .perform_backup(&key, &pattern_a(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(entry.file_count, 2);
    assert!(entry.chunks.len() > 1);
    assert_eq!(*progress.borrow(), BackupStage::Complete);

    let tablet = device(2, &remote, config());
    let tablet_key = tablet.vault_key(&pattern_a()).await;
    assert_ne!(tablet_key, key, "local keys differ per device salt");

    let backup_key = tablet.backups.derive_backup_key(pattern_a()).await.unwrap();
    let summary = tablet
        .backups
        .restore_backup(&backup_key, &tablet_key, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.backup_id, entry.backup_id);
    assert_eq!(summary.file_count, 2);

    let (restored, plain) = tablet.storage.retrieve_file(&photo_id, &tablet_key).unwrap();
    assert_eq!(restored.filename, "photo.jpg");
    assert!(plain.as_slice() == photo.as_slice());
    assert_eq!(tablet.storage.list_files(&tablet_key).unwrap().len(), 2);
}

/// Another pattern finds no backups at all.
#[tokio::test]
async fn other_pattern_finds_nothing() {
    let remote = remote();
    let dev = device(1, &remote, config());
    let key = dev.vault_key(&pattern_a()).await;
    dev.storage.store_file(b"x", "x", "x", &key).unwrap();
    dev.backups
        .perform_backup(&key, &pattern_a(), &CancellationToken::new())
        .await
        .unwrap();

    let wrong = dev.backups.derive_backup_key(pattern_b()).await.unwrap();
    assert!(dev.backups.list_versions(&wrong).await.unwrap().is_empty());
    let err = dev
        .backups
        .restore_backup(&wrong, &key, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::NotAvailable(_)));

    let right = dev.backups.derive_backup_key(pattern_a()).await.unwrap();
    let entry = dev.backups.latest_version(&right).await.unwrap().unwrap();
    assert!(dev.backups.verify_pattern_before_download(&right, &entry));
    assert!(!dev.backups.verify_pattern_before_download(&wrong, &entry));
}

/// A manifest whose token does not verify is refused before any download.
#[tokio::test]
async fn forged_token_is_refused() {
    let remote = remote();
    let dev = device(1, &remote, config());
    let key = dev.vault_key(&pattern_a()).await;
    dev.storage.store_file(b"x", "x", "x", &key).unwrap();
    dev.backups
        .perform_backup(&key, &pattern_a(), &CancellationToken::new())
        .await
        .unwrap();

    edit_manifest(&dev, &remote, &pattern_a(), |m| {
        m["verification_token"] = serde_json::Value::String("00".repeat(32));
    })
    .await;

    let backup_key = dev.backups.derive_backup_key(pattern_a()).await.unwrap();
    let err = dev
        .backups
        .restore_backup(&backup_key, &key, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::ChecksumMismatch));
    assert!(matches!(dev.backups.stage(), BackupStage::Failed { .. }));
}

/// A damaged chunk fails the download and leaves the local vault as it was.
#[tokio::test]
async fn corrupt_chunk_leaves_vault_untouched() {
    let remote = remote();
    let source = device(1, &remote, config());
    let key = source.vault_key(&pattern_a()).await;
    source.storage.store_file(&payload(60_000), "a", "x", &key).unwrap();
    let entry = source
        .backups
        .perform_backup(&key, &pattern_a(), &CancellationToken::new())
        .await
        .unwrap();

    let backup_key = source.backups.derive_backup_key(pattern_a()).await.unwrap();
    let bvid = BackupManager::backup_vault_id(&backup_key).unwrap();
    let chunk = format!("{bvid}/{}/chunk-000001", entry.backup_id);
    let mut bytes = remote.get(&chunk).await.unwrap();
    bytes[10] ^= 0xff;
    remote.put(&chunk, bytes).await.unwrap();

    let target = device(2, &remote, config());
    let target_key = target.vault_key(&pattern_a()).await;
    let local = target.storage.store_file(b"keep me", "local", "x", &target_key).unwrap();

    let err = target
        .backups
        .restore_backup(&backup_key, &target_key, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::DownloadFailed(_)), "got {err:?}");
    assert_eq!(
        target.storage.retrieve_file(&local, &target_key).unwrap().1.as_slice(),
        b"keep me"
    );
    assert_eq!(target.storage.list_files(&target_key).unwrap().len(), 1);
}

/// Tampering that also fixes up the chunk hash is caught by decryption.
#[tokio::test]
async fn tampered_ciphertext_fails_authentication() {
    let remote = remote();
    let dev = device(1, &remote, config());
    let key = dev.vault_key(&pattern_a()).await;
    dev.storage.store_file(&payload(40_000), "a", "x", &key).unwrap();
    let entry = dev
        .backups
        .perform_backup(&key, &pattern_a(), &CancellationToken::new())
        .await
        .unwrap();

    let backup_key = dev.backups.derive_backup_key(pattern_a()).await.unwrap();
    let bvid = BackupManager::backup_vault_id(&backup_key).unwrap();
    let chunk = format!("{bvid}/{}/chunk-000000", entry.backup_id);
    let mut bytes = remote.get(&chunk).await.unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    let hash = blake3::hash(&bytes).to_hex().to_string();
    remote.put(&chunk, bytes).await.unwrap();
    edit_manifest(&dev, &remote, &pattern_a(), |m| {
        m["chunks"][0]["hash"] = serde_json::Value::String(hash);
    })
    .await;

    let err = dev
        .backups
        .restore_backup(&backup_key, &key, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::ChecksumMismatch), "got {err:?}");
    assert_eq!(dev.storage.list_files(&key).unwrap().len(), 1);
}

/// Only the newest `keep_versions` backups survive.
#[tokio::test]
async fn old_versions_are_pruned() {
    let remote = remote();
    let dev = device(
        1,
        &remote,
        BackupConfig {
            keep_versions: 2,
            ..config()
        },
    );
    let key = dev.vault_key(&pattern_a()).await;

    let mut ids = Vec::new();
    for i in 0..3u8 {
        dev.storage.store_file(&[i; 1000], &format!("f{i}"), "x", &key).unwrap();
        let entry = dev
            .backups
            .perform_backup(&key, &pattern_a(), &CancellationToken::new())
            .await
            .unwrap();
        ids.push(entry.backup_id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let backup_key = dev.backups.derive_backup_key(pattern_a()).await.unwrap();
    let versions = dev.backups.list_versions(&backup_key).await.unwrap();
    let kept: Vec<_> = versions.iter().map(|v| v.backup_id.clone()).collect();
    assert_eq!(kept, vec![ids[2].clone(), ids[1].clone()]);
    assert_eq!(versions[0].file_count, 3);

    let removed = dev.backups.delete_version(&backup_key, &ids[1]).await.unwrap();
    assert!(removed > 1);
    assert_eq!(dev.backups.list_versions(&backup_key).await.unwrap().len(), 1);
}

/// With `wifi_only`, a cellular connection refuses to start.
#[tokio::test]
async fn cellular_refused_when_wifi_only() {
    let remote = remote();
    let mut dev = device(
        1,
        &remote,
        BackupConfig {
            wifi_only: true,
            ..config()
        },
    );
    dev.backups = dev
        .backups
        .with_probe(Arc::new(StaticProbe(ConnectionKind::Cellular)));
    let key = dev.vault_key(&pattern_a()).await;

    let err = dev
        .backups
        .perform_backup(&key, &pattern_a(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::WifiRequired));
}
