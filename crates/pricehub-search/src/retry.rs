use std::future::Future;
use std::time::Duration;

use pricehub_core::{ErrorKind, MarketplaceError};
use pricehub_storage::BackoffPolicy;

use crate::observer::SearchObserver;

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, MarketplaceError>,
    pub attempts: u32,
}

/// An upstream `Retry-After` always wins, whatever the error kind.
pub fn retry_delay(
    policy: &BackoffPolicy,
    error: &MarketplaceError,
    attempt: u32,
    rate_limit_default: Duration,
) -> Duration {
    if let Some(wait) = error.retry_after {
        return wait;
    }
    match error.kind {
        ErrorKind::RateLimit => rate_limit_default,
        _ => policy.delay_for_attempt(attempt),
    }
}

pub async fn run_with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    rate_limit_default: Duration,
    observer: &dyn SearchObserver,
    mut attempt: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, MarketplaceError>>,
{
    let max_attempts = policy.max_attempts();
    let mut n = 1;
    loop {
        match attempt(n).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: n,
                }
            }
            Err(error) if !error.is_retryable() || n >= max_attempts => {
                return RetryOutcome {
                    result: Err(error),
                    attempts: n,
                }
            }
            Err(error) => {
                let delay = retry_delay(policy, &error, n, rate_limit_default);
                observer.attempt_failed(&error, n, delay);
                tokio::time::sleep(delay).await;
                n += 1;
            }
        }
    }
}
