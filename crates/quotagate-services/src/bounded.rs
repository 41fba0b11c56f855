use std::future::Future;
use std::time::Duration;

use quotagate_core::{QuotaGateError, Result};

/// Run a counter store call, turning an elapsed `timeout` into a storage error.
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(QuotaGateError::StorageTimeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
