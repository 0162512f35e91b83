//! Bounded exponential backoff around storage operations.

use std::future::Future;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::LoadError;
use crate::config::RetryConfig;
use crate::ports::{MetricsSink, StorageError, StorageOp};

/// Run `op` until it succeeds, fails non-retryably, or attempts run out.
///
/// Every attempt is reported to `metrics`. Backoff sleeps end early with
/// [`LoadError::Cancelled`] when `cancel` fires.
pub(super) async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    cancel: &CancellationToken,
    metrics: &dyn MetricsSink,
    op_kind: StorageOp,
    key: &str,
    mut op: F,
) -> Result<T, LoadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 1;
    loop {
        let start = Instant::now();
        let result = op().await;
        metrics.storage_operation(op_kind, start.elapsed(), result.is_ok());

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                crate::log!(
                    "registry";
                    "{} `{}` failed (attempt {}/{}): {}, retrying in {:?}",
                    op_kind.label(), key, attempt, retry.max_attempts, e, delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(source) => {
                return Err(LoadError::Storage {
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::NoopMetrics;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(
            &fast_retry(4),
            &CancellationToken::new(),
            &NoopMetrics,
            StorageOp::Download,
            "a.gpkg",
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Transient("503".into()))
                } else {
                    Ok(7)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let result: Result<(), _> = with_retry(
            &fast_retry(3),
            &CancellationToken::new(),
            &NoopMetrics,
            StorageOp::List,
            "",
            || async { Err(StorageError::Transient("timeout".into())) },
        )
        .await;

        assert!(matches!(result, Err(LoadError::Storage { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            &fast_retry(5),
            &CancellationToken::new(),
            &NoopMetrics,
            StorageOp::Download,
            "a.gpkg",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::NotFound("a.gpkg".into()))
            },
        )
        .await;

        assert!(matches!(result, Err(LoadError::Storage { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            multiplier: 1.0,
        };

        let canceller = cancel.clone();
        let result: Result<(), _> = with_retry(
            &retry,
            &cancel,
            &NoopMetrics,
            StorageOp::Download,
            "a.gpkg",
            || {
                canceller.cancel();
                async { Err(StorageError::Transient("503".into())) }
            },
        )
        .await;

        assert!(matches!(result, Err(LoadError::Cancelled)));
    }
}
