//! pvault-crypto: key derivation and authenticated encryption for pvault
//!
//! Key hierarchy:
//! ```text
//! Pattern ──Argon2id(device salt)──▶ VaultKey (256-bit, never stored)
//!   ├── Vault id: HKDF(VaultKey, "pvault-vault-id") → on-disk file names
//!   └── wraps MasterKey (256-bit random, one per vault)
//!         └── file contents: streaming XChaCha20-Poly1305
//!
//! Pattern ──Argon2id(fixed salt)──▶ backup key (reproducible across devices)
//! ```
//!
//! Every ciphertext starts with a format byte so older payloads stay
//! decryptable after format upgrades:
//! - `0x01` sealed: `[0x01][24-byte nonce][ciphertext + 16-byte tag]`
//! - `0x02` stream: `[0x02][16-byte stream id][u32 chunk size]{[nonce][ct + tag]}*`

pub mod aead;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod pattern;
pub mod recovery;
pub mod stream;
pub mod token;

pub use aead::{decrypt_any, open, seal};
pub use error::{CryptoError, PatternError};
pub use kdf::{derive_backup_key, derive_vault_key, KdfParams, KeyDeriver};
pub use keys::{ct_eq, generate_device_salt, MasterKey, SymmetricKey, VaultKey};
pub use pattern::{Pattern, PatternRules};
pub use recovery::{generate_phrase, normalize_phrase, validate_custom_phrase, PhraseRules};
pub use stream::{decrypt_stream, encrypt_stream, encrypted_len};
pub use token::{verification_token, verify_token};

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the Argon2id salt
pub const SALT_SIZE: usize = 16;

/// Format byte of a single-shot sealed payload
pub const FORMAT_SEALED: u8 = 0x01;

/// Format byte of a chunked streaming payload
pub const FORMAT_STREAM: u8 = 0x02;

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Decode lowercase or uppercase hex; `None` on odd length or bad digits.
pub fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let bytes = [0x00, 0x7f, 0xab, 0xff];
        assert_eq!(to_hex(&bytes), "007fabff");
        assert_eq!(from_hex("007fabff").unwrap(), bytes);
        assert_eq!(from_hex("007FABFF").unwrap(), bytes);
    }

    #[test]
    fn test_hex_rejects_garbage() {
        assert!(from_hex("abc").is_none());
        assert!(from_hex("zz").is_none());
    }
}
