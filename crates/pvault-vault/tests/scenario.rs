//! End-to-end vault lifecycle through `VaultService`: pattern validation,
//! unlock, large streaming store, instant pattern rotation, recovery.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pvault_core::config::PvaultConfig;
use pvault_crypto::{Pattern, PatternError};
use pvault_secrets::{MemorySecretStore, SecretStore};
use pvault_vault::{RecoveryError, VaultError, VaultService, VaultStorage};
use tempfile::TempDir;

const PHRASE: &str = "orbit velvet canyon mirror thunder lantern pepper";

fn service(root: &Path, store: Arc<dyn SecretStore>, blob_size: u64) -> VaultService {
    let mut config = PvaultConfig::default();
    config.vault.root = root.to_path_buf();
    config.vault.blob_size = blob_size;
    config.crypto.argon2_mem_cost_kib = 1024;
    config.crypto.argon2_time_cost = 1;
    config.crypto.argon2_parallelism = 1;
    VaultService::open(&config, store).expect("service")
}

fn pattern_a() -> Pattern {
    Pattern::new(5, vec![0, 6, 12, 18, 24, 20])
}

fn pattern_b() -> Pattern {
    Pattern::new(5, vec![4, 8, 12, 16, 20, 24])
}

#[tokio::test]
async fn full_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let svc = service(tmp.path(), Arc::new(MemorySecretStore::new()), 16 * 1024 * 1024);

    // five nodes is below the minimum
    let short = Pattern::new(5, vec![0, 6, 12, 18, 24]);
    match svc.unlock(short).await {
        Err(VaultError::Pattern(PatternError::TooShort { got: 5, min: 6 })) => {}
        Err(other) => panic!("expected TooShort, got {other:?}"),
        Ok(_) => panic!("short pattern must be rejected"),
    }

    let unlocked = svc.unlock(pattern_a()).await.unwrap();
    assert_eq!(unlocked.stats.files, 0);
    assert!(unlocked.wipe.is_none());

    let data: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
    let file_id = svc
        .store_file(&unlocked.key, data.clone(), "clip.mp4".into(), "video/mp4".into())
        .await
        .unwrap();

    let new_key = svc.derive_key(pattern_b()).await.unwrap();
    let start = Instant::now();
    svc.storage().change_vault_key(&unlocked.key, &new_key).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(100), "rotation took {elapsed:?}");

    let (entry, plain) = svc.retrieve_file(&new_key, file_id).await.unwrap();
    assert_eq!(entry.filename, "clip.mp4");
    assert!(plain.as_slice() == data.as_slice(), "retrieved bytes differ");

    // the old pattern now opens an empty vault
    let old = svc.unlock(pattern_a()).await.unwrap();
    assert_eq!(old.stats.files, 0);

    match svc.recover("nobody ever registered this phrase anywhere".into()).await {
        Err(RecoveryError::InvalidPhrase) => {}
        other => panic!("expected InvalidPhrase, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn change_pattern_carries_recovery_and_duress() {
    let tmp = TempDir::new().unwrap();
    let svc = service(tmp.path(), Arc::new(MemorySecretStore::new()), 256 * 1024);

    let key_a = svc.unlock(pattern_a()).await.unwrap().key;
    let file_id = svc
        .store_file(&key_a, b"carried over".to_vec(), "n.txt".into(), "text/plain".into())
        .await
        .unwrap();
    svc.recovery().save(PHRASE, &pattern_a(), &key_a).unwrap();
    svc.duress().set_as_duress_vault(&key_a).unwrap();

    let key_b = svc.change_pattern(&key_a, pattern_b()).await.unwrap();

    assert_eq!(svc.retrieve_file(&key_b, file_id).await.unwrap().1.as_slice(), b"carried over");
    assert_eq!(svc.recover(PHRASE.into()).await.unwrap(), key_b);
    assert!(svc.duress().is_duress_key(&key_b).unwrap());
    assert!(!svc.duress().is_duress_key(&key_a).unwrap());
}

/// Rotation cost must not grow with the amount of stored content.
#[test]
fn rotation_is_independent_of_content() {
    use pvault_crypto::VaultKey;

    let tmp = TempDir::new().unwrap();
    let storage = VaultStorage::with_params(tmp.path(), 8 * 1024 * 1024, 64 * 1024).unwrap();
    let key = |b: u8| VaultKey::from_bytes([b; 32]);

    storage.store_file(&[1u8; 1024], "one", "x", &key(1)).unwrap();
    for i in 0..100u32 {
        let data = vec![(i % 251) as u8; 64 * 1024];
        storage.store_file(&data, &format!("f{i}"), "x", &key(2)).unwrap();
    }

    let time = |from: u8, to: u8| {
        let start = Instant::now();
        storage.change_vault_key(&key(from), &key(to)).unwrap();
        start.elapsed()
    };
    let small = time(1, 3);
    let large = time(2, 4);

    assert!(
        large < small * 10 + Duration::from_millis(50),
        "rotation scaled with content: 1 file {small:?}, 100 files {large:?}"
    );
    assert_eq!(storage.list_files(&key(4)).unwrap().len(), 100);
}

#[tokio::test]
async fn retrieve_to_path_commits_only_on_success() {
    let tmp = TempDir::new().unwrap();
    let svc = service(tmp.path(), Arc::new(MemorySecretStore::new()), 256 * 1024);
    let key = svc.unlock(pattern_a()).await.unwrap().key;

    let src = tmp.path().join("in.bin");
    std::fs::write(&src, vec![7u8; 50_000]).unwrap();
    let id = svc
        .store_path(&key, src.clone(), "in.bin".into(), "application/octet-stream".into())
        .await
        .unwrap();

    let out = tmp.path().join("out.bin");
    svc.retrieve_to_path(&key, id, out.clone()).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), vec![7u8; 50_000]);

    let missing = tmp.path().join("missing.bin");
    let err = svc.retrieve_to_path(&key, uuid::Uuid::new_v4(), missing.clone()).await;
    assert!(matches!(err, Err(VaultError::FileUnavailable)));
    assert!(!missing.exists());
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 3, "no temp file left behind");
}
