pub mod config;
pub mod error;
pub mod fsutil;
pub mod types;

pub use error::{PvaultError, PvaultResult};
