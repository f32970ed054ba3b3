//! Storage health check

use crate::error::StorageResult;
use crate::store::RemoteStore;

/// Verify the endpoint is reachable by listing the store root.
pub async fn check_health(store: &RemoteStore) -> StorageResult<()> {
    store.list("").await.map(|_| ())
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub async fn is_healthy(store: &RemoteStore) -> bool {
    check_health(store).await.is_ok()
}
