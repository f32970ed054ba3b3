//! pvault-storage: remote chunk store for encrypted backups
//!
//! Thin layer over OpenDAL: an S3-compatible operator in production, the
//! in-memory service in tests.

pub mod error;
pub mod health;
pub mod operator;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use health::{check_health, is_healthy};
pub use operator::{build_operator, memory_operator, S3Credentials};
pub use store::RemoteStore;
