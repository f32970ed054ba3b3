//! Single-shot XChaCha20-Poly1305 seal/open for small payloads
//! (vault index, wrapped master key, recovery database)
//!
//! Sealed format (binary):
//! ```text
//! [1 byte: 0x01][24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! The caller-supplied AAD binds each payload to its purpose, so a sealed
//! index cannot be replayed as a wrapped key and vice versa.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;
use crate::keys::{fill_random, SymmetricKey};
use crate::stream::decrypt_stream;
use crate::{FORMAT_SEALED, FORMAT_STREAM, NONCE_SIZE, TAG_SIZE};

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// Returns: `[0x01][24-byte nonce][ciphertext][16-byte tag]`
pub fn seal<K: SymmetricKey>(key: &K, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.key_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    fill_random(&mut nonce_bytes)?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let mut result = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    result.push(FORMAT_SEALED);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a payload produced by [`seal`].
///
/// Any malformed input, wrong key, wrong AAD or tampering yields
/// [`CryptoError::Decrypt`]; no partial plaintext is ever returned.
pub fn open<K: SymmetricKey>(key: &K, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < 1 + NONCE_SIZE + TAG_SIZE || sealed[0] != FORMAT_SEALED {
        return Err(CryptoError::Decrypt);
    }

    let (nonce_bytes, ciphertext) = sealed[1..].split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.key_bytes().into());

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

/// Decrypt an in-memory payload of any known format, dispatching on the
/// leading format byte.
pub fn decrypt_any<K: SymmetricKey>(key: &K, aad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match data.first() {
        Some(&FORMAT_SEALED) => open(key, aad, data),
        Some(&FORMAT_STREAM) => {
            let mut out = Vec::with_capacity(data.len());
            decrypt_stream(key, aad, &mut std::io::Cursor::new(data), &mut out, data.len() as u64)?;
            Ok(out)
        }
        _ => Err(CryptoError::Decrypt),
    }
}
