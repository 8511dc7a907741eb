use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use gr_core::{Error, Result};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff with jitter for retryable errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // Three attempts over roughly ten seconds.
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        // Up to 25% jitter so synchronized retries spread out.
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Run `f`, retrying [`Error::is_retryable`] failures under `policy`. A
/// rate-limited error waits the provider's hint when it is shorter than the
/// backoff cap. Exhaustion promotes the last error to [`Error::Failure`].
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let backoff = policy.delay_for(attempt);
                let wait = match e.retry_after() {
                    Some(hint) if hint < backoff => hint,
                    _ => backoff,
                };
                warn!(op, attempt, error = %e, wait_ms = wait.as_millis() as u64, "retrying");
                tokio::time::sleep(wait).await;
            }
            Err(e) if e.is_retryable() => return Err(e.into_failure()),
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transient("flaky".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_promotes_to_failure() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(Error::Transient("still down".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Failure(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(Error::Conflict("no".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_rate_limit_hint_is_respected() {
        let calls = AtomicU32::new(0);
        let start = std::time::Instant::now();
        let result = retry_with_backoff(&fast_policy(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::RateLimited {
                        retry_after_secs: 0,
                    })
                } else {
                    Ok(1)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
