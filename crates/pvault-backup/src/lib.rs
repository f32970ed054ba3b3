//! pvault-backup: encrypted, chunked, resumable vault backups
//!
//! A backup is a stream-encrypted container (header, index, used blob
//! region) split into fixed-size chunks on an OpenDAL store, plus a manifest
//! written last. Everything is keyed by the pattern's fixed-salt backup key.

pub mod container;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod probe;
pub mod staging;

pub use engine::{BackupManager, RestoreSummary};
pub use error::{BackupError, BackupResult};
pub use manifest::{BackupChunk, BackupVersionEntry, MANIFEST_VERSION};
pub use probe::{check_policy, ConnectionKind, NetworkProbe, StaticProbe};
pub use staging::{Checkpoint, StagingArea};
