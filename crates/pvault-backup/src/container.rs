//! Backup container: the plaintext that gets stream-encrypted and chunked.
//!
//! ```text
//! b"PVBK" | version: u8 | index_len: u32 BE | index JSON | blob[0..used]
//! ```
//!
//! The index inside carries the MasterKey wrapped under the backup key, so
//! the container opens on any device that knows the pattern.

use std::io::{self, Read, Write};

use zeroize::Zeroizing;

const MAGIC: &[u8; 4] = b"PVBK";
pub const CONTAINER_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4;
/// Indexes are small; anything larger is a corrupt header.
const MAX_INDEX_LEN: usize = 64 * 1024 * 1024;

/// Authenticated-data prefix binding a container stream to its backup id.
pub fn stream_context(backup_id: &str) -> Vec<u8> {
    [b"pvault-backup-container".as_slice(), backup_id.as_bytes()].concat()
}

/// Plaintext length of a container.
pub fn container_len(index_len: usize, blob_len: u64) -> u64 {
    (HEADER_LEN + index_len) as u64 + blob_len
}

/// Reader producing the container bytes from an index and a blob region.
pub fn container_reader<'a, R: Read + 'a>(index_json: &'a [u8], blob: R) -> io::Result<impl Read + 'a> {
    let len = u32::try_from(index_json.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "index too large for container"))?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.push(CONTAINER_VERSION);
    header.extend_from_slice(&len.to_be_bytes());
    Ok(io::Cursor::new(header).chain(index_json).chain(blob))
}

/// `Write` sink that splits a decrypted container: header and index are
/// held in memory, blob bytes stream straight into `blob`.
pub struct ContainerSink<W: Write> {
    header: Vec<u8>,
    index_len: Option<usize>,
    index: Zeroizing<Vec<u8>>,
    blob: W,
    blob_written: u64,
}

impl<W: Write> ContainerSink<W> {
    pub fn new(blob: W) -> Self {
        Self {
            header: Vec::with_capacity(HEADER_LEN),
            index_len: None,
            index: Zeroizing::new(Vec::new()),
            blob,
            blob_written: 0,
        }
    }

    fn parse_header(header: &[u8]) -> io::Result<usize> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
        if &header[..4] != MAGIC {
            return Err(invalid("not a backup container"));
        }
        if header[4] != CONTAINER_VERSION {
            return Err(invalid("unsupported container version"));
        }
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if len > MAX_INDEX_LEN {
            return Err(invalid("container index length out of range"));
        }
        Ok(len)
    }

    /// Index JSON, the blob writer, and the number of blob bytes written.
    pub fn finish(mut self) -> io::Result<(Zeroizing<Vec<u8>>, W, u64)> {
        match self.index_len {
            Some(len) if self.index.len() == len => {
                self.blob.flush()?;
                Ok((self.index, self.blob, self.blob_written))
            }
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "container truncated")),
        }
    }
}

impl<W: Write> Write for ContainerSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let total = buf.len();
        let mut rest = buf;

        if self.index_len.is_none() {
            let take = (HEADER_LEN - self.header.len()).min(rest.len());
            self.header.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.header.len() == HEADER_LEN {
                let len = Self::parse_header(&self.header)?;
                self.index.reserve_exact(len);
                self.index_len = Some(len);
            }
        }

        if let Some(len) = self.index_len {
            let take = (len - self.index.len()).min(rest.len());
            self.index.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if !rest.is_empty() {
                self.blob.write_all(rest)?;
                self.blob_written += rest.len() as u64;
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.blob.flush()
    }
}
