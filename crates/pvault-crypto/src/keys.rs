//! Key types: VaultKey (pattern-derived), MasterKey (random, per vault),
//! master-key wrapping, and identifier derivation

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::aead::{open, seal};
use crate::error::CryptoError;
use crate::{to_hex, KEY_SIZE, SALT_SIZE};

/// AAD bound to every wrapped master key.
const MASTER_KEY_AAD: &[u8] = b"pvault-master-key-v2";

/// Access to raw key bytes for the AEAD layer.
pub trait SymmetricKey {
    fn key_bytes(&self) -> &[u8; KEY_SIZE];
}

/// Defines a 256-bit key newtype: zeroized on drop, redacted `Debug`,
/// constant-time `PartialEq`.
macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl SymmetricKey for $name {
            fn key_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                ct_eq(&self.bytes, &other.bytes)
            }
        }

        impl Eq for $name {}

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key!(
    /// A 256-bit key derived from a pattern or phrase. Unlocks one vault's index.
    VaultKey
);

secret_key!(
    /// A random 256-bit key that encrypts file contents of one vault.
    ///
    /// Only ever persisted wrapped under a [`VaultKey`].
    MasterKey
);

impl VaultKey {
    /// SHA-256 of the key. Used as the recovery-database lookup handle; the
    /// key itself is never stored.
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.bytes).into()
    }

    pub fn hash_hex(&self) -> String {
        to_hex(&self.hash())
    }

    /// Domain-separated SHA-256 of the key, for markers that must not be
    /// linkable to the recovery-database hash.
    pub fn tagged_hash(&self, domain: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        hasher.update(self.bytes);
        hasher.finalize().into()
    }

    /// Deterministic public identifier for this key (32 hex chars),
    /// HKDF-SHA256 with a domain-specific info string.
    pub fn derive_id(&self, domain: &[u8]) -> Result<String, CryptoError> {
        let okm = hkdf_derive(&self.bytes, domain)?;
        Ok(to_hex(&okm[..16]))
    }
}

impl MasterKey {
    /// Generate a fresh random master key from the OS CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self::from_bytes(bytes))
    }

    /// Wrap (seal) this master key under a vault key.
    pub fn wrap(&self, vault_key: &VaultKey) -> Result<Vec<u8>, CryptoError> {
        seal(vault_key, MASTER_KEY_AAD, &self.bytes)
    }

    /// Unwrap a master key sealed by [`MasterKey::wrap`].
    pub fn unwrap_with(vault_key: &VaultKey, wrapped: &[u8]) -> Result<Self, CryptoError> {
        let plaintext = Zeroizing::new(open(vault_key, MASTER_KEY_AAD, wrapped)?);
        if plaintext.len() != KEY_SIZE {
            return Err(CryptoError::Decrypt);
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&plaintext);
        Ok(Self::from_bytes(bytes))
    }
}

/// Generate a random 16-byte device salt for device-bound derivation.
pub fn generate_device_salt() -> Result<[u8; SALT_SIZE], CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    fill_random(&mut salt)?;
    Ok(salt)
}

/// Fill `buf` from the OS CSPRNG, surfacing failure instead of panicking.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CryptoError::Rng(e.to_string()))
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Constant-time byte comparison. Length mismatch returns early; lengths are
/// not secret here.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NONCE_SIZE, TAG_SIZE};

    #[test]
    fn test_master_key_generation() {
        let k1 = MasterKey::generate().unwrap();
        let k2 = MasterKey::generate().unwrap();
        assert_ne!(k1, k2, "random keys must differ");
    }

    #[test]
    fn test_master_key_wrap_unwrap_roundtrip() {
        let vault_key = VaultKey::from_bytes([42u8; KEY_SIZE]);
        let master = MasterKey::generate().unwrap();

        let wrapped = master.wrap(&vault_key).unwrap();
        let unwrapped = MasterKey::unwrap_with(&vault_key, &wrapped).unwrap();

        assert_eq!(master, unwrapped);
    }

    #[test]
    fn test_master_key_unwrap_wrong_vault_key() {
        let k1 = VaultKey::from_bytes([1u8; KEY_SIZE]);
        let k2 = VaultKey::from_bytes([2u8; KEY_SIZE]);
        let master = MasterKey::generate().unwrap();

        let wrapped = master.wrap(&k1).unwrap();
        assert!(matches!(
            MasterKey::unwrap_with(&k2, &wrapped),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_wrapped_key_size() {
        let vault_key = VaultKey::from_bytes([7u8; KEY_SIZE]);
        let wrapped = MasterKey::generate().unwrap().wrap(&vault_key).unwrap();

        // format (1) + nonce (24) + key (32) + tag (16) = 73
        assert_eq!(wrapped.len(), 1 + NONCE_SIZE + KEY_SIZE + TAG_SIZE);
    }

    #[test]
    fn test_derive_id_domains_differ() {
        let key = VaultKey::from_bytes([9u8; KEY_SIZE]);
        let a = key.derive_id(b"pvault-vault-id").unwrap();
        let b = key.derive_id(b"pvault-backup-id").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(a, key.derive_id(b"pvault-vault-id").unwrap());
    }

    #[test]
    fn test_hash_is_not_key() {
        let key = VaultKey::from_bytes([3u8; KEY_SIZE]);
        assert_ne!(&key.hash(), key.as_bytes());
        assert_ne!(key.hash(), key.tagged_hash(b"pvault-duress"));
        assert_eq!(key.hash_hex().len(), 64);
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = VaultKey::from_bytes([0xAB; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("171"));
    }
}
