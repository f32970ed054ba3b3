//! Network policy for backup traffic.

use crate::error::{BackupError, BackupResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Wifi,
    Wired,
    Cellular,
    Offline,
    Unknown,
}

/// Reports the current connection type. Platform integrations implement
/// this; the CLI uses [`StaticProbe`].
pub trait NetworkProbe: Send + Sync {
    fn connection(&self) -> ConnectionKind;
}

#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub ConnectionKind);

impl NetworkProbe for StaticProbe {
    fn connection(&self) -> ConnectionKind {
        self.0
    }
}

/// Refuse transfers when offline, or on metered links when `wifi_only`.
pub fn check_policy(probe: &dyn NetworkProbe, wifi_only: bool) -> BackupResult<()> {
    match probe.connection() {
        ConnectionKind::Offline => Err(BackupError::NotAvailable("no network connection".into())),
        ConnectionKind::Cellular if wifi_only => Err(BackupError::WifiRequired),
        _ => Ok(()),
    }
}
