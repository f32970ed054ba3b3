//! Preallocated, random-filled blob files.
//!
//! A blob is created at its full size and filled from the OS CSPRNG, so
//! unused space is indistinguishable from ciphertext and the file size never
//! changes as content is added.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use pvault_crypto::keys::fill_random;
use zeroize::Zeroize;

use crate::error::VaultResult;

const FILL_CHUNK: usize = 1024 * 1024;

/// Create (or replace) `path` as a `size`-byte blob of random bytes.
///
/// Written through a sibling temp file and renamed, so a crash never leaves a
/// short blob under the final name.
pub fn preallocate(path: &Path, size: u64) -> VaultResult<()> {
    let tmp = pvault_core::fsutil::temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        fill_random_to(&mut file, size)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    pvault_core::fsutil::sync_parent(path);
    tracing::debug!(path = %path.display(), size, "blob preallocated");
    Ok(())
}

/// Append `len` random bytes to `writer`.
pub fn fill_random_to<W: Write + ?Sized>(writer: &mut W, len: u64) -> VaultResult<()> {
    let mut buf = vec![0u8; FILL_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(FILL_CHUNK as u64) as usize;
        fill_random(&mut buf[..n])?;
        writer.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Open an existing blob for in-place writing at `offset`.
///
/// The returned writer must be flushed and the file synced by the caller via
/// [`finish_write`].
pub fn writer_at(path: &Path, offset: u64) -> VaultResult<BufWriter<File>> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(BufWriter::with_capacity(FILL_CHUNK, file))
}

pub fn finish_write(writer: BufWriter<File>) -> VaultResult<()> {
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_data()?;
    Ok(())
}

/// Reader over `[offset, offset + len)` of a blob.
pub fn region_reader(path: &Path, offset: u64, len: u64) -> VaultResult<std::io::Take<File>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(file.take(len))
}

/// Read a whole region into memory (small payloads only).
pub fn read_region(path: &Path, offset: u64, len: u64) -> VaultResult<Vec<u8>> {
    let mut out = Vec::with_capacity(len as usize);
    region_reader(path, offset, len)?.read_to_end(&mut out)?;
    if (out.len() as u64) < len {
        out.zeroize();
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "blob region truncated").into());
    }
    Ok(out)
}
