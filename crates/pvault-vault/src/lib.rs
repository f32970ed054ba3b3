//! pvault-vault: the vault engine
//!
//! One preallocated random blob plus one sealed index per vault, addressed
//! by a pattern-derived key. Any key opens *a* vault: an unknown key gets a
//! fresh empty one, so no pattern is ever reported as wrong.
//!
//! - [`storage`]: blob+index engine, migration, pattern rotation
//! - [`recovery`]: phrase → vault database that hides the vault count
//! - [`duress`]: the pattern that wipes every other vault
//! - [`service`]: async facade used by the CLI and backup engine

pub mod blob;
pub mod duress;
pub mod error;
pub mod index;
pub mod locks;
pub mod recovery;
pub mod service;
pub mod storage;

pub use duress::{DuressHandler, WipeFailure, WipeReport};
pub use error::{DuressError, DuressResult, RecoveryError, RecoveryResult, VaultError, VaultResult};
pub use index::{FileEntry, KeySource, ShareRecord, VaultIndex, INDEX_VERSION};
pub use recovery::RecoveryPhraseManager;
pub use service::{load_device_salt, Unlocked, VaultService};
pub use storage::{RestoreTarget, VaultSnapshot, VaultStorage};
