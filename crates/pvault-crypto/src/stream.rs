//! Chunked streaming XChaCha20-Poly1305 over any `Read`/`Write` pair
//!
//! Stream format (binary):
//! ```text
//! [1 byte: 0x02][16 bytes: random stream id][4 bytes: chunk size, big-endian]
//! then for every chunk:
//! [24 bytes: random nonce][ciphertext (<= chunk size)][16 bytes: tag]
//! AAD = stream_id (16) || chunk_index (8, big-endian) || final flag (1) || context
//! ```
//!
//! The final flag is authenticated, so truncating a stream at a chunk
//! boundary or appending chunks fails closed. Peak memory is two plaintext
//! chunks regardless of stream length.

use std::io::{Read, Write};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keys::{fill_random, SymmetricKey};
use crate::{FORMAT_STREAM, NONCE_SIZE, TAG_SIZE};

const STREAM_ID_SIZE: usize = 16;

/// Bytes before the first chunk
pub const STREAM_HEADER_SIZE: usize = 1 + STREAM_ID_SIZE + 4;

/// Per-chunk ciphertext overhead (nonce + tag)
pub const CHUNK_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Largest accepted chunk size; bounds the allocation a header can request.
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Exact ciphertext length `encrypt_stream` produces for `plaintext_len`
/// bytes. An empty input still produces one (empty) final chunk.
pub fn encrypted_len(plaintext_len: u64, chunk_size: u32) -> u64 {
    let cs = u64::from(chunk_size.clamp(1, MAX_CHUNK_SIZE));
    let chunks = plaintext_len.div_ceil(cs).max(1);
    STREAM_HEADER_SIZE as u64 + chunks * CHUNK_OVERHEAD as u64 + plaintext_len
}

/// Encrypt everything `reader` yields into `writer`.
///
/// `context` is authenticated with every chunk (e.g. a file id), binding the
/// ciphertext to where it is stored. Returns the number of bytes written.
pub fn encrypt_stream<K, R, W>(
    key: &K,
    context: &[u8],
    reader: &mut R,
    writer: &mut W,
    chunk_size: u32,
) -> Result<u64, CryptoError>
where
    K: SymmetricKey,
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
    let cs = chunk_size as usize;
    let cipher = XChaCha20Poly1305::new(key.key_bytes().into());

    let mut stream_id = [0u8; STREAM_ID_SIZE];
    fill_random(&mut stream_id)?;

    writer.write_all(&[FORMAT_STREAM])?;
    writer.write_all(&stream_id)?;
    writer.write_all(&chunk_size.to_be_bytes())?;
    let mut written = STREAM_HEADER_SIZE as u64;

    let mut current = Zeroizing::new(vec![0u8; cs]);
    let mut next = Zeroizing::new(vec![0u8; cs]);
    let mut filled = read_full(reader, &mut current)?;
    let mut index = 0u64;

    loop {
        // Read ahead one chunk so the last one can be flagged as final.
        let (is_final, next_filled) = if filled < cs {
            (true, 0)
        } else {
            let n = read_full(reader, &mut next)?;
            (n == 0, n)
        };

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        fill_random(&mut nonce_bytes)?;
        let aad = build_aad(&stream_id, index, is_final, context);
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &current[..filled],
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        writer.write_all(&nonce_bytes)?;
        writer.write_all(&ciphertext)?;
        written += (NONCE_SIZE + ciphertext.len()) as u64;

        if is_final {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        filled = next_filled;
        index += 1;
    }

    writer.flush()?;
    Ok(written)
}

/// Decrypt `total_len` bytes of a stream produced by [`encrypt_stream`].
///
/// Returns the number of plaintext bytes written. On error, anything already
/// written to `writer` is unauthenticated and must be discarded; callers
/// decrypt into a scratch sink and commit only on `Ok`.
pub fn decrypt_stream<K, R, W>(
    key: &K,
    context: &[u8],
    reader: &mut R,
    writer: &mut W,
    total_len: u64,
) -> Result<u64, CryptoError>
where
    K: SymmetricKey,
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    if total_len < (STREAM_HEADER_SIZE + CHUNK_OVERHEAD) as u64 {
        return Err(CryptoError::Decrypt);
    }

    let mut header = [0u8; STREAM_HEADER_SIZE];
    read_exact_or_decrypt(reader, &mut header)?;
    if header[0] != FORMAT_STREAM {
        return Err(CryptoError::Decrypt);
    }
    let mut stream_id = [0u8; STREAM_ID_SIZE];
    stream_id.copy_from_slice(&header[1..1 + STREAM_ID_SIZE]);
    let mut cs_bytes = [0u8; 4];
    cs_bytes.copy_from_slice(&header[1 + STREAM_ID_SIZE..]);
    let chunk_size = u32::from_be_bytes(cs_bytes);
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(CryptoError::Decrypt);
    }

    let cipher = XChaCha20Poly1305::new(key.key_bytes().into());
    let full_chunk = chunk_size as u64 + CHUNK_OVERHEAD as u64;
    let mut remaining = total_len - STREAM_HEADER_SIZE as u64;
    let mut buf = vec![0u8; full_chunk as usize];
    let mut index = 0u64;
    let mut plaintext_total = 0u64;

    loop {
        let this_len = remaining.min(full_chunk);
        if this_len < CHUNK_OVERHEAD as u64 {
            return Err(CryptoError::Decrypt);
        }
        let is_final = this_len == remaining;
        let chunk = &mut buf[..this_len as usize];
        read_exact_or_decrypt(reader, chunk)?;

        let (nonce_bytes, ciphertext) = chunk.split_at(NONCE_SIZE);
        let aad = build_aad(&stream_id, index, is_final, context);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    XNonce::from_slice(nonce_bytes),
                    Payload {
                        msg: ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| CryptoError::Decrypt)?,
        );

        writer.write_all(&plaintext)?;
        plaintext_total += plaintext.len() as u64;
        remaining -= this_len;

        if is_final {
            break;
        }
        index += 1;
    }

    writer.flush()?;
    Ok(plaintext_total)
}

/// AAD: stream_id (16) || chunk_index (8 BE) || final (1) || context
fn build_aad(stream_id: &[u8; STREAM_ID_SIZE], index: u64, is_final: bool, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(STREAM_ID_SIZE + 8 + 1 + context.len());
    aad.extend_from_slice(stream_id);
    aad.extend_from_slice(&index.to_be_bytes());
    aad.push(u8::from(is_final));
    aad.extend_from_slice(context);
    aad
}

/// Fill `buf` as far as the reader allows; returns bytes read (< len only at EOF).
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A short read inside a declared stream is a malformed ciphertext, not I/O.
fn read_exact_or_decrypt<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<(), CryptoError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => CryptoError::Decrypt,
        _ => CryptoError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterKey;
    use crate::KEY_SIZE;
    use proptest::prelude::*;

    fn key() -> MasterKey {
        MasterKey::from_bytes([0x33; KEY_SIZE])
    }

    fn make_data(size: usize) -> Vec<u8> {
        (0..size)
            .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
            .collect()
    }

    fn encrypt(data: &[u8], chunk: u32) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_stream(&key(), b"file-1", &mut &data[..], &mut out, chunk).unwrap();
        out
    }

    fn decrypt(ct: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        decrypt_stream(&key(), b"file-1", &mut &ct[..], &mut out, ct.len() as u64)?;
        Ok(out)
    }

    #[test]
    fn test_stream_roundtrip_multi_chunk() {
        let data = make_data(10_000);
        let ct = encrypt(&data, 1024);
        assert_eq!(decrypt(&ct).unwrap(), data);
    }

    #[test]
    fn test_stream_exact_multiple_of_chunk() {
        let data = make_data(4096);
        let ct = encrypt(&data, 1024);
        assert_eq!(ct.len() as u64, encrypted_len(4096, 1024));
        assert_eq!(decrypt(&ct).unwrap(), data);
    }

    #[test]
    fn test_stream_empty() {
        let ct = encrypt(b"", 1024);
        assert_eq!(ct.len() as u64, encrypted_len(0, 1024));
        assert_eq!(decrypt(&ct).unwrap(), b"");
    }

    #[test]
    fn test_encrypted_len_matches_output() {
        for size in [1usize, 1023, 1024, 1025, 5000] {
            let ct = encrypt(&make_data(size), 1024);
            assert_eq!(ct.len() as u64, encrypted_len(size as u64, 1024), "size {size}");
        }
    }

    #[test]
    fn test_truncated_at_chunk_boundary_fails() {
        let data = make_data(3000);
        let ct = encrypt(&data, 1024);
        // Drop the final chunk entirely: the previous chunk was not flagged final.
        let cut = STREAM_HEADER_SIZE + 2 * (1024 + CHUNK_OVERHEAD);
        assert!(decrypt(&ct[..cut]).is_err());
    }

    #[test]
    fn test_extended_stream_fails() {
        let mut ct = encrypt(&make_data(100), 1024);
        ct.extend_from_slice(&[0u8; 64]);
        assert!(decrypt(&ct).is_err());
    }

    #[test]
    fn test_tampered_chunk_fails() {
        let mut ct = encrypt(&make_data(3000), 1024);
        let pos = STREAM_HEADER_SIZE + 1024 + CHUNK_OVERHEAD + 40;
        ct[pos] ^= 0x01;
        assert!(matches!(decrypt(&ct), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_wrong_context_fails() {
        let ct = encrypt(&make_data(100), 1024);
        let mut out = Vec::new();
        let res = decrypt_stream(&key(), b"file-2", &mut &ct[..], &mut out, ct.len() as u64);
        assert!(res.is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let ct = encrypt(&make_data(100), 1024);
        let other = MasterKey::from_bytes([0x44; KEY_SIZE]);
        let mut out = Vec::new();
        let res = decrypt_stream(&other, b"file-1", &mut &ct[..], &mut out, ct.len() as u64);
        assert!(matches!(res, Err(CryptoError::Decrypt)));
    }

    proptest! {
        #[test]
        fn prop_stream_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..5_000),
                                 chunk in 16u32..4096) {
            let mut ct = Vec::new();
            encrypt_stream(&key(), b"", &mut data.as_slice(), &mut ct, chunk).unwrap();
            prop_assert_eq!(ct.len() as u64, encrypted_len(data.len() as u64, chunk));
            let mut out = Vec::new();
            decrypt_stream(&key(), b"", &mut ct.as_slice(), &mut out, ct.len() as u64).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}
