//! Backup verification tokens: HMAC-SHA256 under the backup key, checked
//! before any chunk is downloaded

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;
use crate::keys::{SymmetricKey, VaultKey};
use crate::{from_hex, to_hex};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_DOMAIN: &[u8] = b"pvault-backup-verify";

fn mac_for(key: &VaultKey, backup_id: &str) -> Result<HmacSha256, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key.key_bytes())
        .map_err(|e| CryptoError::Kdf(format!("HMAC init failed: {e}")))?;
    mac.update(TOKEN_DOMAIN);
    mac.update(backup_id.as_bytes());
    Ok(mac)
}

/// Hex HMAC-SHA256 binding `backup_id` to the backup key.
pub fn verification_token(key: &VaultKey, backup_id: &str) -> Result<String, CryptoError> {
    Ok(to_hex(&mac_for(key, backup_id)?.finalize().into_bytes()))
}

/// Constant-time check of a stored token. Malformed hex is a mismatch.
pub fn verify_token(key: &VaultKey, backup_id: &str, token: &str) -> bool {
    let Some(expected) = from_hex(token) else {
        return false;
    };
    match mac_for(key, backup_id) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}
