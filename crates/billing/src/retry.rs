//! Bounded retry for store-detected write conflicts

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

/// Attempts after the first before a conflict is surfaced
pub const MAX_CONFLICT_RETRIES: usize = 3;

/// Re-run `action` from the start while it fails with a retryable error.
pub async fn retry_on_conflict<T, F, Fut>(operation: &'static str, mut action: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(10)
        .max_delay(Duration::from_millis(200))
        .map(jitter)
        .take(MAX_CONFLICT_RETRIES);

    RetryIf::spawn(
        strategy,
        || {
            let attempt = action();
            async move {
                let result = attempt.await;
                if let Err(e) = &result {
                    if e.is_retryable() {
                        tracing::warn!(operation, error = %e, "Write conflict, retrying");
                    }
                }
                result
            }
        },
        |e: &BillingError| e.is_retryable(),
    )
    .await
}
