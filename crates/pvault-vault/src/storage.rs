//! VaultStorage: the blob+index engine.
//!
//! Each VaultKey addresses its own pair of files, named by an HKDF of the key:
//! ```text
//! <root>/vaults/{vault_id}.idx        sealed VaultIndex
//! <root>/vaults/{vault_id}.blob       preallocated blob (generation 0)
//! <root>/vaults/{vault_id}.g{n}.blob  blob installed by the n-th restore
//! ```
//!
//! A key with no readable index at its address gets a fresh empty vault, so
//! a wrong pattern and a brand-new pattern behave identically.
//!
//! Every method is synchronous and may block on disk I/O; async callers go
//! through [`crate::service::VaultService`].

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use pvault_core::config::VaultConfig;
use pvault_core::fsutil::{atomic_write, remove_if_exists, sync_parent};
use pvault_core::types::{unix_now, VaultStats};
use pvault_crypto::{
    decrypt_stream, encrypt_stream, encrypted_len, open, seal, CryptoError, MasterKey,
    SymmetricKey, VaultKey, FORMAT_SEALED, FORMAT_STREAM,
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::blob;
use crate::error::{VaultError, VaultResult};
use crate::index::{FileEntry, KeySource, VaultIndex, INDEX_VERSION};
use crate::locks::VaultLocks;

const VAULT_ID_DOMAIN: &[u8] = b"pvault-vault-id";
const THUMBNAIL_AAD: &[u8] = b"pvault-thumbnail";

/// Consistent view of a vault for backup: the index, its unwrapped master key
/// and an open handle on the blob. The region `[0, used)` is append-only, so
/// reading it after the vault lock is released is safe.
pub struct VaultSnapshot {
    pub index: VaultIndex,
    pub master: MasterKey,
    pub blob: File,
    pub used: u64,
}

/// Scratch blob a restore streams into before it is committed.
#[derive(Debug)]
pub struct RestoreTarget {
    vault_id: String,
    path: PathBuf,
}

impl RestoreTarget {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct VaultStorage {
    dir: PathBuf,
    blob_size: u64,
    stream_chunk_size: u32,
    locks: VaultLocks,
}

impl VaultStorage {
    /// Open (creating if needed) the vault directory under `config.root`.
    pub fn open(config: &VaultConfig) -> VaultResult<Self> {
        let root = pvault_core::config::expand_tilde(&config.root);
        Self::with_params(&root, config.blob_size, config.stream_chunk_size)
    }

    pub fn with_params(root: &Path, blob_size: u64, stream_chunk_size: u32) -> VaultResult<Self> {
        let dir = root.join("vaults");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            blob_size,
            stream_chunk_size,
            locks: VaultLocks::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn blob_size(&self) -> u64 {
        self.blob_size
    }

    pub fn stream_chunk_size(&self) -> u32 {
        self.stream_chunk_size
    }

    /// On-disk identifier for `key`: 32 hex chars of HKDF(key, "pvault-vault-id").
    pub fn vault_id(key: &VaultKey) -> VaultResult<String> {
        Ok(key.derive_id(VAULT_ID_DOMAIN)?)
    }

    fn index_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.idx"))
    }

    fn blob_path(&self, id: &str, generation: u32) -> PathBuf {
        if generation == 0 {
            self.dir.join(format!("{id}.blob"))
        } else {
            self.dir.join(format!("{id}.g{generation}.blob"))
        }
    }

    // ── locked internals ─────────────────────────────────────────────────

    /// Read and open the index at `id`. Absent or undecryptable → `None`.
    fn read_index(&self, id: &str, key: &VaultKey) -> VaultResult<Option<VaultIndex>> {
        let sealed = match std::fs::read(self.index_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(VaultIndex::open_sealed(key, &sealed))
    }

    fn write_index(&self, id: &str, index: &VaultIndex, key: &VaultKey) -> VaultResult<()> {
        atomic_write(&self.index_path(id), &index.seal(key)?)?;
        Ok(())
    }

    /// Fresh empty vault: blob first, then index.
    fn create_vault(&self, id: &str, key: &VaultKey) -> VaultResult<(VaultIndex, MasterKey)> {
        let master = MasterKey::generate()?;
        let mut index = VaultIndex::new(self.blob_size);
        index.set_master_key(&master, key)?;

        blob::preallocate(&self.blob_path(id, 0), self.blob_size)?;
        self.write_index(id, &index, key)?;
        info!(vault = short(id), size = self.blob_size, "vault created");
        Ok((index, master))
    }

    /// v1 → v2: new MasterKey wrapped under `key`. Existing entries keep
    /// `key_source = vault_key` until the next rotation re-encrypts them.
    fn migrate(&self, id: &str, mut index: VaultIndex, key: &VaultKey) -> VaultResult<(VaultIndex, MasterKey)> {
        let master = MasterKey::generate()?;
        index.set_master_key(&master, key)?;
        index.version = INDEX_VERSION;
        for entry in &mut index.files {
            entry.key_source = KeySource::VaultKey;
        }
        self.write_index(id, &index, key)?;
        info!(
            vault = short(id),
            legacy_files = index.live_files().count(),
            "migrated v1 index to v2"
        );
        Ok((index, master))
    }

    /// The `loadIndex` state machine. Caller holds the vault lock.
    fn load_locked(&self, id: &str, key: &VaultKey) -> VaultResult<(VaultIndex, MasterKey)> {
        let Some(mut index) = self.read_index(id, key)? else {
            return self.create_vault(id, key);
        };
        if !self.settle_outgoing(id, &mut index, key)? {
            return self.create_vault(id, key);
        }
        self.settle_incoming(id, &mut index, key)?;
        if !self.blob_path(id, index.blob_generation).exists() {
            warn!(vault = short(id), "index without blob, recreating vault");
            return self.create_vault(id, key);
        }
        if index.encrypted_master_key.is_none() {
            return self.migrate(id, index, key);
        }
        match index.master_key(key) {
            Ok(master) => Ok((index, master)),
            Err(_) => {
                warn!(vault = short(id), "master key unreadable, recreating vault");
                self.create_vault(id, key)
            }
        }
    }

    /// Settle a pattern change that stopped after this index was marked as
    /// moving. The blob rename is the commit point: with our blob gone the
    /// move went through and this address is stale (returns `false`);
    /// otherwise the half-written target index is dropped and the vault stays.
    fn settle_outgoing(&self, id: &str, index: &mut VaultIndex, key: &VaultKey) -> VaultResult<bool> {
        let Some(target) = index.rotating_to.take() else {
            return Ok(true);
        };
        if !self.blob_path(id, index.blob_generation).exists() {
            warn!(from = short(id), to = short(&target), "dropping address left by an interrupted pattern change");
            self.remove_files_locked(id)?;
            return Ok(false);
        }
        // a target index with no blob can only be the uncommitted move
        if !self.has_blob(&target)? {
            remove_if_exists(&self.index_path(&target))?;
        }
        self.write_index(id, index, key)?;
        warn!(vault = short(id), "interrupted pattern change rolled back");
        Ok(true)
    }

    /// Counterpart of [`Self::settle_outgoing`] for the new address: finish
    /// the blob move if it never happened, then drop the old index.
    fn settle_incoming(&self, id: &str, index: &mut VaultIndex, key: &VaultKey) -> VaultResult<()> {
        let Some(source) = index.rotated_from.take() else {
            return Ok(());
        };
        let ours = self.blob_path(id, index.blob_generation);
        let theirs = self.blob_path(&source, index.blob_generation);
        if !ours.exists() && theirs.exists() {
            std::fs::rename(&theirs, &ours)?;
            sync_parent(&ours);
            warn!(from = short(&source), to = short(id), "interrupted pattern change completed");
        }
        // an old index that still owns a blob is a vault created there since
        if !self.has_blob(&source)? {
            remove_if_exists(&self.index_path(&source))?;
            sync_parent(&ours);
        }
        self.write_index(id, index, key)
    }

    /// Whether any blob generation exists for `id`.
    fn has_blob(&self, id: &str) -> VaultResult<bool> {
        let prefix = format!("{id}.");
        for dirent in std::fs::read_dir(&self.dir)? {
            let name = dirent?.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".blob") {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Append `reader` (at most `len` bytes) to the blob under `master`.
    fn append_encrypted<R: Read + ?Sized>(
        &self,
        id: &str,
        index: &mut VaultIndex,
        master: &MasterKey,
        file_id: Uuid,
        reader: &mut R,
        len: u64,
    ) -> VaultResult<(u64, u64)> {
        let needed = encrypted_len(len, self.stream_chunk_size);
        let available = index.available();
        if needed > available {
            return Err(VaultError::CapacityExceeded { needed, available });
        }

        let offset = index.next_offset;
        let mut writer = blob::writer_at(&self.blob_path(id, index.blob_generation), offset)?;
        let mut counted = CountingReader::new(reader.take(len));
        let written = encrypt_stream(
            master,
            file_id.as_bytes(),
            &mut counted,
            &mut writer,
            self.stream_chunk_size,
        )?;
        blob::finish_write(writer)?;

        if counted.count != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended after {} of {len} bytes", counted.count),
            )
            .into());
        }
        index.next_offset += written;
        Ok((offset, written))
    }

    fn open_region(&self, id: &str, index: &VaultIndex, entry: &FileEntry) -> VaultResult<std::io::Take<File>> {
        blob::region_reader(&self.blob_path(id, index.blob_generation), entry.offset, entry.size)
    }

    /// Re-encrypt every live legacy entry under `master`, appending the new
    /// ciphertext. Old regions stay where they are.
    fn reencrypt_legacy(
        &self,
        id: &str,
        index: &mut VaultIndex,
        master: &MasterKey,
        vault_key: &VaultKey,
    ) -> VaultResult<usize> {
        let legacy: Vec<FileEntry> = index
            .live_files()
            .filter(|f| f.key_source == KeySource::VaultKey)
            .cloned()
            .collect();

        for entry in &legacy {
            let mut plaintext = Zeroizing::new(Vec::with_capacity(entry.original_size as usize));
            let region = self.open_region(id, index, entry)?;
            decrypt_content(vault_key, entry.file_id.as_bytes(), region, entry.size, &mut *plaintext)
                .map_err(map_read_err)?;

            let thumbnail = match &entry.encrypted_thumbnail {
                Some(t) => Some(reseal_thumbnail(t, &entry.file_id, vault_key, master)?),
                None => None,
            };

            let (offset, size) = self.append_encrypted(
                id,
                index,
                master,
                entry.file_id,
                &mut plaintext.as_slice(),
                plaintext.len() as u64,
            )?;
            if let Some(e) = index.find_mut(&entry.file_id) {
                e.offset = offset;
                e.size = size;
                e.original_size = plaintext.len() as u64;
                e.key_source = KeySource::MasterKey;
                e.encrypted_thumbnail = thumbnail;
            }
        }
        if !legacy.is_empty() {
            info!(vault = short(id), files = legacy.len(), "re-encrypted legacy files under master key");
        }
        Ok(legacy.len())
    }

    /// Remove index and every blob generation for `id`. Caller holds the lock.
    fn remove_files_locked(&self, id: &str) -> VaultResult<usize> {
        // index first: no index, no vault
        let mut removed = usize::from(remove_if_exists(&self.index_path(id))?);
        let prefix = format!("{id}.");
        let hidden = format!(".{id}.");
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) || name.starts_with(&hidden) {
                removed += usize::from(remove_if_exists(&dirent.path())?);
            }
        }
        sync_parent(&self.index_path(id));
        Ok(removed)
    }

    // ── public operations ────────────────────────────────────────────────

    /// Open the vault addressed by `key`, creating it when no readable index
    /// exists there. Never reports which of the two happened.
    pub fn load_index(&self, key: &VaultKey) -> VaultResult<VaultIndex> {
        let id = Self::vault_id(key)?;
        let handle = self.locks.handle(&id);
        let _guard = VaultLocks::acquire(&handle);
        Ok(self.load_locked(&id, key)?.0)
    }

    /// Seal and atomically replace the index addressed by `key`.
    pub fn save_index(&self, index: &VaultIndex, key: &VaultKey) -> VaultResult<()> {
        let id = Self::vault_id(key)?;
        let handle = self.locks.handle(&id);
        let _guard = VaultLocks::acquire(&handle);
        self.write_index(&id, index, key)
    }

    pub fn store_file(&self, data: &[u8], filename: &str, mime_type: &str, key: &VaultKey) -> VaultResult<Uuid> {
        let mut reader = data;
        self.store_stream(&mut reader, data.len() as u64, filename, mime_type, key)
    }

    /// Encrypt `len` bytes from `reader` straight into the blob.
    pub fn store_stream<R: Read + ?Sized>(
        &self,
        reader: &mut R,
        len: u64,
        filename: &str,
        mime_type: &str,
        key: &VaultKey,
    ) -> VaultResult<Uuid> {
        let id = Self::vault_id(key)?;
        let handle = self.locks.handle(&id);
        let _guard = VaultLocks::acquire(&handle);

        let (mut index, master) = self.load_locked(&id, key)?;
        let file_id = Uuid::new_v4();
        let (offset, size) = self.append_encrypted(&id, &mut index, &master, file_id, reader, len)?;

        index.files.push(FileEntry {
            file_id,
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            offset,
            size,
            original_size: len,
            is_deleted: false,
            created_at: unix_now(),
            encrypted_thumbnail: None,
            key_source: KeySource::MasterKey,
        });
        self.write_index(&id, &index, key)?;
        info!(vault = short(&id), file = %file_id, bytes = len, "file stored");
        Ok(file_id)
    }

    /// Decrypt a file into `writer`. On error, whatever reached `writer` is
    /// unauthenticated and must be discarded.
    pub fn retrieve_to_writer<W: Write + ?Sized>(
        &self,
        file_id: &Uuid,
        key: &VaultKey,
        writer: &mut W,
    ) -> VaultResult<FileEntry> {
        let id = Self::vault_id(key)?;
        let (entry, master, region) = {
            let handle = self.locks.handle(&id);
            let _guard = VaultLocks::acquire(&handle);
            let (index, master) = self.load_locked(&id, key)?;
            let entry = index.find(file_id).cloned().ok_or(VaultError::FileUnavailable)?;
            let region = self.open_region(&id, &index, &entry)?;
            (entry, master, region)
        };

        let result = match entry.key_source {
            KeySource::MasterKey => decrypt_content(&master, file_id.as_bytes(), region, entry.size, writer),
            KeySource::VaultKey => decrypt_content(key, file_id.as_bytes(), region, entry.size, writer),
        };
        result.map_err(map_read_err)?;
        debug!(vault = short(&id), file = %file_id, "file retrieved");
        Ok(entry)
    }

    pub fn retrieve_file(&self, file_id: &Uuid, key: &VaultKey) -> VaultResult<(FileEntry, Zeroizing<Vec<u8>>)> {
        let mut out = Zeroizing::new(Vec::new());
        let entry = self.retrieve_to_writer(file_id, key, &mut *out)?;
        Ok((entry, out))
    }

    /// Mark an entry deleted. Its blob region is left untouched.
    pub fn delete_file(&self, file_id: &Uuid, key: &VaultKey) -> VaultResult<()> {
        let id = Self::vault_id(key)?;
        let handle = self.locks.handle(&id);
        let _guard = VaultLocks::acquire(&handle);

        let (mut index, _master) = self.load_locked(&id, key)?;
        let entry = index.find_mut(file_id).ok_or(VaultError::FileUnavailable)?;
        entry.is_deleted = true;
        self.write_index(&id, &index, key)?;
        info!(vault = short(&id), file = %file_id, "file deleted");
        Ok(())
    }

    pub fn list_files(&self, key: &VaultKey) -> VaultResult<Vec<FileEntry>> {
        Ok(self.load_index(key)?.live_files().cloned().collect())
    }

    /// Re-key a vault: the same MasterKey is re-wrapped under `new` and the
    /// blob is renamed to the new address. File content is not touched
    /// (legacy entries excepted, which are re-encrypted under the MasterKey).
    ///
    /// Both indexes name each other before the blob moves, so a load on
    /// either side after a crash can tell which one is live.
    pub fn change_vault_key(&self, old: &VaultKey, new: &VaultKey) -> VaultResult<()> {
        let old_id = Self::vault_id(old)?;
        let new_id = Self::vault_id(new)?;
        if old_id == new_id {
            return Ok(());
        }

        let (first, second) = self.locks.pair(&old_id, &new_id);
        let _g1 = VaultLocks::acquire(&first);
        let _g2 = second.as_deref().map(VaultLocks::acquire);

        let (mut index, master) = self.load_locked(&old_id, old)?;

        if let Some(existing) = self.read_index(&new_id, new)? {
            if existing.live_files().next().is_some() {
                return Err(VaultError::KeyInUse);
            }
        }

        if index.has_legacy_entries() {
            self.reencrypt_legacy(&old_id, &mut index, &master, old)?;
        }

        // an empty vault at the target address is discarded
        self.remove_files_locked(&new_id)?;

        index.rotating_to = Some(new_id.clone());
        self.write_index(&old_id, &index, old)?;

        let mut moved = index.clone();
        moved.rotating_to = None;
        moved.rotated_from = Some(old_id.clone());
        moved.set_master_key(&master, new)?;
        self.write_index(&new_id, &moved, new)?;

        let old_blob = self.blob_path(&old_id, index.blob_generation);
        let new_blob = self.blob_path(&new_id, index.blob_generation);
        if let Err(e) = std::fs::rename(&old_blob, &new_blob) {
            self.settle_outgoing(&old_id, &mut index, old)?;
            return Err(e.into());
        }
        sync_parent(&new_blob);

        remove_if_exists(&self.index_path(&old_id))?;
        sync_parent(&new_blob);
        moved.rotated_from = None;
        self.write_index(&new_id, &moved, new)?;

        info!(from = short(&old_id), to = short(&new_id), "vault key rotated");
        Ok(())
    }

    pub fn set_custom_name(&self, key: &VaultKey, name: Option<String>) -> VaultResult<()> {
        self.update(key, |index, _| {
            index.custom_name = name;
            Ok(())
        })
    }

    /// Record that this vault is shared. Duress marking is cleared by the
    /// service layer when this succeeds.
    pub fn mark_shared(&self, key: &VaultKey, shared_vault_id: &str) -> VaultResult<()> {
        self.update(key, |index, _| {
            index.is_shared_vault = true;
            index.shared_vault_id = Some(shared_vault_id.to_string());
            Ok(())
        })
    }

    /// Attach a thumbnail, sealed under the same key as the file content.
    pub fn set_thumbnail(&self, file_id: &Uuid, key: &VaultKey, thumbnail: &[u8]) -> VaultResult<()> {
        self.update(key, |index, master| {
            let entry = index.find_mut(file_id).ok_or(VaultError::FileUnavailable)?;
            let aad = thumbnail_aad(file_id);
            let sealed = match entry.key_source {
                KeySource::MasterKey => seal(master, &aad, thumbnail)?,
                KeySource::VaultKey => seal(key, &aad, thumbnail)?,
            };
            entry.encrypted_thumbnail = Some(STANDARD.encode(sealed));
            Ok(())
        })
    }

    pub fn thumbnail(&self, file_id: &Uuid, key: &VaultKey) -> VaultResult<Option<Zeroizing<Vec<u8>>>> {
        let id = Self::vault_id(key)?;
        let handle = self.locks.handle(&id);
        let _guard = VaultLocks::acquire(&handle);
        let (index, master) = self.load_locked(&id, key)?;
        let entry = index.find(file_id).ok_or(VaultError::FileUnavailable)?;
        let Some(encoded) = &entry.encrypted_thumbnail else {
            return Ok(None);
        };
        let sealed = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| VaultError::FileUnavailable)?;
        let aad = thumbnail_aad(file_id);
        let plain = match entry.key_source {
            KeySource::MasterKey => open(&master, &aad, &sealed),
            KeySource::VaultKey => open(key, &aad, &sealed),
        }
        .map_err(map_read_err)?;
        Ok(Some(Zeroizing::new(plain)))
    }

    pub fn vault_stats(&self, key: &VaultKey) -> VaultResult<VaultStats> {
        Ok(self.load_index(key)?.stats())
    }

    /// Ids of every vault with an index on disk.
    pub fn known_vault_ids(&self) -> VaultResult<Vec<String>> {
        let mut ids = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let name = dirent?.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".idx") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a vault's index and blobs. Returns the number of files removed.
    pub fn destroy_vault_files(&self, vault_id: &str) -> VaultResult<usize> {
        let handle = self.locks.handle(vault_id);
        let _guard = VaultLocks::acquire(&handle);
        let removed = self.remove_files_locked(vault_id)?;
        info!(vault = short(vault_id), removed, "vault files destroyed");
        Ok(removed)
    }

    /// Consistent snapshot for backup. Legacy entries are re-encrypted first
    /// since a device-bound vault key cannot decrypt them elsewhere.
    pub fn snapshot(&self, key: &VaultKey) -> VaultResult<VaultSnapshot> {
        let id = Self::vault_id(key)?;
        let handle = self.locks.handle(&id);
        let _guard = VaultLocks::acquire(&handle);

        let (mut index, master) = self.load_locked(&id, key)?;
        if index.has_legacy_entries() {
            self.reencrypt_legacy(&id, &mut index, &master, key)?;
            self.write_index(&id, &index, key)?;
        }
        let blob = File::open(self.blob_path(&id, index.blob_generation))?;
        let used = index.next_offset;
        Ok(VaultSnapshot {
            index,
            master,
            blob,
            used,
        })
    }

    /// Scratch file for a restore into the vault addressed by `key`.
    pub fn begin_restore(&self, key: &VaultKey) -> VaultResult<RestoreTarget> {
        let id = Self::vault_id(key)?;
        let path = self.dir.join(format!(".{id}.restore"));
        remove_if_exists(&path)?;
        Ok(RestoreTarget { vault_id: id, path })
    }

    pub fn abort_restore(&self, target: RestoreTarget) {
        if let Err(e) = remove_if_exists(&target.path) {
            warn!(path = %target.path.display(), error = %e, "could not remove restore scratch file");
        }
    }

    /// Install a restored vault: pad the scratch blob to capacity, move it to
    /// a new blob generation, then swap the index. The local vault is
    /// replaced only once the new index is in place.
    pub fn commit_restore(
        &self,
        key: &VaultKey,
        target: RestoreTarget,
        mut index: VaultIndex,
        master: &MasterKey,
    ) -> VaultResult<()> {
        let id = Self::vault_id(key)?;
        if id != target.vault_id {
            self.abort_restore(target);
            return Err(VaultError::Encoding("restore target belongs to another vault".into()));
        }
        let handle = self.locks.handle(&id);
        let _guard = VaultLocks::acquire(&handle);

        let written = std::fs::metadata(&target.path)?.len();
        let capacity = self.blob_size.max(index.total_size).max(written);
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&target.path)?;
            blob::fill_random_to(&mut file, capacity - written)?;
            file.sync_all()?;
        }

        let previous = self.read_index(&id, key)?.map(|i| i.blob_generation);
        let generation = previous.map_or(0, |g| g + 1);
        let new_blob = self.blob_path(&id, generation);
        std::fs::rename(&target.path, &new_blob)?;
        sync_parent(&new_blob);

        index.version = INDEX_VERSION;
        index.blob_generation = generation;
        index.rotating_to = None;
        index.rotated_from = None;
        index.total_size = capacity;
        index.set_master_key(master, key)?;
        self.write_index(&id, &index, key)?;

        if let Some(old) = previous {
            if let Err(e) = remove_if_exists(&self.blob_path(&id, old)) {
                warn!(vault = short(&id), error = %e, "could not remove superseded blob");
            }
        }
        info!(vault = short(&id), generation, files = index.live_files().count(), "restored vault installed");
        Ok(())
    }

    /// Locked read-modify-write of the index.
    fn update<F>(&self, key: &VaultKey, f: F) -> VaultResult<()>
    where
        F: FnOnce(&mut VaultIndex, &MasterKey) -> VaultResult<()>,
    {
        let id = Self::vault_id(key)?;
        let handle = self.locks.handle(&id);
        let _guard = VaultLocks::acquire(&handle);
        let (mut index, master) = self.load_locked(&id, key)?;
        f(&mut index, &master)?;
        self.write_index(&id, &index, key)
    }
}

/// Decrypt a stored payload of either format into `writer`.
fn decrypt_content<K, R, W>(key: &K, context: &[u8], mut reader: R, len: u64, writer: &mut W) -> Result<u64, CryptoError>
where
    K: SymmetricKey,
    R: Read,
    W: Write + ?Sized,
{
    let mut first = [0u8; 1];
    reader.read_exact(&mut first).map_err(|_| CryptoError::Decrypt)?;
    let mut chained = (&first[..]).chain(reader);
    match first[0] {
        FORMAT_STREAM => decrypt_stream(key, context, &mut chained, writer, len),
        FORMAT_SEALED => {
            let mut sealed = Vec::with_capacity(len as usize);
            chained.read_to_end(&mut sealed)?;
            let plain = Zeroizing::new(open(key, context, &sealed)?);
            writer.write_all(&plain)?;
            Ok(plain.len() as u64)
        }
        _ => Err(CryptoError::Decrypt),
    }
}

fn map_read_err(e: CryptoError) -> VaultError {
    match e {
        CryptoError::Io(io) => VaultError::Io(io),
        _ => VaultError::FileUnavailable,
    }
}

fn thumbnail_aad(file_id: &Uuid) -> Vec<u8> {
    [THUMBNAIL_AAD, file_id.as_bytes().as_slice()].concat()
}

fn reseal_thumbnail(encoded: &str, file_id: &Uuid, from: &VaultKey, to: &MasterKey) -> VaultResult<String> {
    let sealed = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|_| VaultError::FileUnavailable)?;
    let aad = thumbnail_aad(file_id);
    let plain = Zeroizing::new(open(from, &aad, &sealed).map_err(map_read_err)?);
    Ok(STANDARD.encode(seal(to, &aad, &plain)?))
}

/// Log-safe prefix of a vault id.
pub(crate) fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BLOB: u64 = 256 * 1024;

    fn storage(tmp: &TempDir) -> VaultStorage {
        VaultStorage::with_params(tmp.path(), BLOB, 4096).unwrap()
    }

    fn key(b: u8) -> VaultKey {
        VaultKey::from_bytes([b; 32])
    }

    #[test]
    fn test_fresh_key_creates_empty_vault() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let index = s.load_index(&key(1)).unwrap();

        assert_eq!(index.version, INDEX_VERSION);
        assert!(index.files.is_empty());
        assert_eq!(index.total_size, BLOB);
        assert!(index.encrypted_master_key.is_some());

        let id = VaultStorage::vault_id(&key(1)).unwrap();
        assert_eq!(std::fs::metadata(s.blob_path(&id, 0)).unwrap().len(), BLOB);
        assert_eq!(s.known_vault_ids().unwrap(), vec![id]);
    }

    #[test]
    fn test_load_is_stable() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let a = s.load_index(&key(1)).unwrap();
        let b = s.load_index(&key(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_store_retrieve_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        let id = s.store_file(&data, "a.bin", "application/octet-stream", &key(1)).unwrap();
        let (entry, plain) = s.retrieve_file(&id, &key(1)).unwrap();

        assert_eq!(plain.as_slice(), data.as_slice());
        assert_eq!(entry.filename, "a.bin");
        assert_eq!(entry.original_size, 20_000);
        assert_eq!(entry.size, encrypted_len(20_000, 4096));
        assert_eq!(s.load_index(&key(1)).unwrap().next_offset, entry.size);
    }

    #[test]
    fn test_store_empty_file() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"", "empty", "text/plain", &key(1)).unwrap();
        assert!(s.retrieve_file(&id, &key(1)).unwrap().1.is_empty());
    }

    #[test]
    fn test_capacity_exceeded() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let big = vec![0u8; BLOB as usize];
        let err = s.store_file(&big, "big", "x", &key(1)).unwrap_err();
        match err {
            VaultError::CapacityExceeded { needed, available } => {
                assert!(needed > available);
                assert_eq!(available, BLOB);
            }
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
        assert_eq!(s.load_index(&key(1)).unwrap().next_offset, 0);
    }

    #[test]
    fn test_short_reader_rejected_without_index_change() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let mut short: &[u8] = b"only ten b";
        let err = s.store_stream(&mut short, 100, "x", "x", &key(1)).unwrap_err();
        assert!(matches!(err, VaultError::Io(_)));
        assert!(s.list_files(&key(1)).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_unavailable() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        assert!(matches!(
            s.retrieve_file(&Uuid::new_v4(), &key(1)),
            Err(VaultError::FileUnavailable)
        ));
        assert!(matches!(
            s.delete_file(&Uuid::new_v4(), &key(1)),
            Err(VaultError::FileUnavailable)
        ));
    }

    #[test]
    fn test_corrupted_region_unavailable() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"precious", "p", "text/plain", &key(1)).unwrap();
        let vid = VaultStorage::vault_id(&key(1)).unwrap();
        let entry = s.list_files(&key(1)).unwrap().remove(0);

        let mut w = blob::writer_at(&s.blob_path(&vid, 0), entry.offset + 30).unwrap();
        w.write_all(&[0xFF; 4]).unwrap();
        blob::finish_write(w).unwrap();

        assert!(matches!(s.retrieve_file(&id, &key(1)), Err(VaultError::FileUnavailable)));
    }

    #[test]
    fn test_delete_does_not_reclaim() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"to be deleted", "d", "text/plain", &key(1)).unwrap();
        let vid = VaultStorage::vault_id(&key(1)).unwrap();
        let before = std::fs::read(s.blob_path(&vid, 0)).unwrap();
        let offset = s.load_index(&key(1)).unwrap().next_offset;

        s.delete_file(&id, &key(1)).unwrap();

        let index = s.load_index(&key(1)).unwrap();
        assert_eq!(index.next_offset, offset);
        assert_eq!(index.stats().deleted, 1);
        assert!(s.list_files(&key(1)).unwrap().is_empty());
        assert_eq!(std::fs::read(s.blob_path(&vid, 0)).unwrap(), before);

        // new content goes after the deleted region
        s.store_file(b"next", "n", "text/plain", &key(1)).unwrap();
        let entry = s.list_files(&key(1)).unwrap().remove(0);
        assert_eq!(entry.offset, offset);
    }

    #[test]
    fn test_rotation_keeps_content_and_removes_old_address() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"rotate me", "r", "text/plain", &key(1)).unwrap();
        let old_id = VaultStorage::vault_id(&key(1)).unwrap();

        s.change_vault_key(&key(1), &key(2)).unwrap();

        assert_eq!(s.retrieve_file(&id, &key(2)).unwrap().1.as_slice(), b"rotate me");
        assert!(!s.index_path(&old_id).exists());
        assert!(!s.blob_path(&old_id, 0).exists());
        assert_eq!(s.known_vault_ids().unwrap().len(), 1);

        // the old pattern now opens a fresh, empty vault
        assert!(s.list_files(&key(1)).unwrap().is_empty());
    }

    #[test]
    fn test_rotation_refuses_to_clobber_vault_with_content() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        s.store_file(b"a", "a", "x", &key(1)).unwrap();
        s.store_file(b"b", "b", "x", &key(2)).unwrap();
        assert!(matches!(s.change_vault_key(&key(1), &key(2)), Err(VaultError::KeyInUse)));
        assert_eq!(s.list_files(&key(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_rotation_to_same_key_is_noop() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"same", "s", "x", &key(1)).unwrap();
        s.change_vault_key(&key(1), &key(1)).unwrap();
        assert_eq!(s.retrieve_file(&id, &key(1)).unwrap().1.as_slice(), b"same");
    }

    /// Replay `change_vault_key` up to the blob move (and, with `move_blob`,
    /// the move itself) without the cleanup that follows.
    fn interrupted_rotation(s: &VaultStorage, old: &VaultKey, new: &VaultKey, move_blob: bool) {
        let old_id = VaultStorage::vault_id(old).unwrap();
        let new_id = VaultStorage::vault_id(new).unwrap();
        let (mut index, master) = s.load_locked(&old_id, old).unwrap();
        index.rotating_to = Some(new_id.clone());
        s.write_index(&old_id, &index, old).unwrap();

        let mut moved = index.clone();
        moved.rotating_to = None;
        moved.rotated_from = Some(old_id.clone());
        moved.set_master_key(&master, new).unwrap();
        s.write_index(&new_id, &moved, new).unwrap();
        if move_blob {
            std::fs::rename(s.blob_path(&old_id, 0), s.blob_path(&new_id, 0)).unwrap();
        }
    }

    #[test]
    fn test_old_pattern_after_committed_rotation_cannot_clobber() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"moved content", "m", "x", &key(1)).unwrap();
        interrupted_rotation(&s, &key(1), &key(2), true);

        // the stale old index must not accept writes into the moved blob
        let fresh = s.store_file(&[7u8; 5000], "late", "x", &key(1)).unwrap();
        let old_files = s.list_files(&key(1)).unwrap();
        assert_eq!(old_files.len(), 1);
        assert_eq!(old_files[0].file_id, fresh);

        assert_eq!(s.retrieve_file(&id, &key(2)).unwrap().1.as_slice(), b"moved content");
        let index = s.load_index(&key(2)).unwrap();
        assert!(index.rotated_from.is_none());
        assert_eq!(index.live_files().count(), 1);
        // the vault created at the old address survives the cleanup
        assert_eq!(s.list_files(&key(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_new_pattern_completes_interrupted_rotation() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"in flight", "f", "x", &key(1)).unwrap();
        let old_id = VaultStorage::vault_id(&key(1)).unwrap();
        interrupted_rotation(&s, &key(1), &key(2), false);

        assert_eq!(s.retrieve_file(&id, &key(2)).unwrap().1.as_slice(), b"in flight");
        assert!(!s.index_path(&old_id).exists());
        assert!(!s.blob_path(&old_id, 0).exists());
        assert!(s.list_files(&key(1)).unwrap().is_empty());
    }

    #[test]
    fn test_old_pattern_rolls_back_uncommitted_rotation() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"stays put", "p", "x", &key(1)).unwrap();
        let new_id = VaultStorage::vault_id(&key(2)).unwrap();
        interrupted_rotation(&s, &key(1), &key(2), false);

        assert_eq!(s.retrieve_file(&id, &key(1)).unwrap().1.as_slice(), b"stays put");
        assert!(s.load_index(&key(1)).unwrap().rotating_to.is_none());
        assert!(!s.index_path(&new_id).exists());
        assert!(s.list_files(&key(2)).unwrap().is_empty());
        assert_eq!(s.list_files(&key(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_v1_migration_and_legacy_reencryption() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let vid = VaultStorage::vault_id(&key(1)).unwrap();

        // hand-build a v1 vault: content sealed directly under the vault key
        blob::preallocate(&s.blob_path(&vid, 0), BLOB).unwrap();
        let file_id = Uuid::new_v4();
        let sealed = seal(&key(1), file_id.as_bytes(), b"legacy content").unwrap();
        let mut w = blob::writer_at(&s.blob_path(&vid, 0), 0).unwrap();
        w.write_all(&sealed).unwrap();
        blob::finish_write(w).unwrap();

        let mut v1 = VaultIndex::new(BLOB);
        v1.version = 1;
        v1.next_offset = sealed.len() as u64;
        v1.files.push(FileEntry {
            file_id,
            filename: "old.txt".into(),
            mime_type: "text/plain".into(),
            offset: 0,
            size: sealed.len() as u64,
            original_size: 14,
            is_deleted: false,
            created_at: 0,
            encrypted_thumbnail: None,
            key_source: KeySource::VaultKey,
        });
        s.save_index(&v1, &key(1)).unwrap();

        let migrated = s.load_index(&key(1)).unwrap();
        assert_eq!(migrated.version, INDEX_VERSION);
        assert!(migrated.encrypted_master_key.is_some());
        assert_eq!(migrated.files[0].key_source, KeySource::VaultKey);
        assert_eq!(s.retrieve_file(&file_id, &key(1)).unwrap().1.as_slice(), b"legacy content");

        s.change_vault_key(&key(1), &key(2)).unwrap();
        let rotated = s.load_index(&key(2)).unwrap();
        assert_eq!(rotated.files[0].key_source, KeySource::MasterKey);
        assert!(rotated.files[0].offset >= sealed.len() as u64);
        assert_eq!(s.retrieve_file(&file_id, &key(2)).unwrap().1.as_slice(), b"legacy content");
    }

    #[test]
    fn test_thumbnail_roundtrip_survives_rotation() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"image", "i.png", "image/png", &key(1)).unwrap();
        assert!(s.thumbnail(&id, &key(1)).unwrap().is_none());
        s.set_thumbnail(&id, &key(1), b"tiny").unwrap();
        s.change_vault_key(&key(1), &key(2)).unwrap();
        assert_eq!(s.thumbnail(&id, &key(2)).unwrap().unwrap().as_slice(), b"tiny");
    }

    #[test]
    fn test_custom_name_and_shared_flag() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        s.set_custom_name(&key(1), Some("Travel".into())).unwrap();
        s.mark_shared(&key(1), "share-123").unwrap();
        let index = s.load_index(&key(1)).unwrap();
        assert_eq!(index.custom_name.as_deref(), Some("Travel"));
        assert!(index.is_shared_vault);
        assert_eq!(index.shared_vault_id.as_deref(), Some("share-123"));
    }

    #[test]
    fn test_destroy_vault_files() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        s.load_index(&key(1)).unwrap();
        s.load_index(&key(2)).unwrap();
        let victim = VaultStorage::vault_id(&key(1)).unwrap();

        assert_eq!(s.destroy_vault_files(&victim).unwrap(), 2);
        assert_eq!(
            s.known_vault_ids().unwrap(),
            vec![VaultStorage::vault_id(&key(2)).unwrap()]
        );
    }

    #[test]
    fn test_snapshot_covers_used_region() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        s.store_file(b"snap", "s", "x", &key(1)).unwrap();
        let snap = s.snapshot(&key(1)).unwrap();
        assert_eq!(snap.used, snap.index.next_offset);
        assert_eq!(snap.index.live_files().count(), 1);
        assert_eq!(snap.blob.metadata().unwrap().len(), BLOB);
    }

    #[test]
    fn test_commit_restore_swaps_generation() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let id = s.store_file(b"original", "o", "x", &key(1)).unwrap();
        let snap = s.snapshot(&key(1)).unwrap();

        // "restore" the snapshot into the same vault
        let target = s.begin_restore(&key(1)).unwrap();
        let mut used = Vec::new();
        (&snap.blob).take(snap.used).read_to_end(&mut used).unwrap();
        std::fs::write(target.path(), &used).unwrap();
        s.commit_restore(&key(1), target, snap.index.clone(), &snap.master).unwrap();

        let vid = VaultStorage::vault_id(&key(1)).unwrap();
        let index = s.load_index(&key(1)).unwrap();
        assert_eq!(index.blob_generation, 1);
        assert!(!s.blob_path(&vid, 0).exists());
        assert_eq!(std::fs::metadata(s.blob_path(&vid, 1)).unwrap().len(), BLOB);
        assert_eq!(s.retrieve_file(&id, &key(1)).unwrap().1.as_slice(), b"original");
    }
}
