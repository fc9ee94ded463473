//! Retry with exponential backoff for provider calls
//!
//! Transient errors (network, timeout, 5xx, rate limit) are retried with
//! exponential backoff and jitter. Cancellation short-circuits between
//! attempts and during backoff sleeps.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{MycelicError, Result};

/// Backoff parameters
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Jitter fraction applied to each delay (0.1 = ±10%)
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.1,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (1-based), with jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.cap.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }
}

/// Run an operation with retries on transient errors
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(MycelicError::Cancelled);
        }

        let result = tokio::select! {
            r = f() => r,
            _ = cancel.cancelled() => return Err(MycelicError::Cancelled),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient provider error, retrying: {}",
                    e
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(MycelicError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_for(1).as_secs_f64();
            assert!((0.9..=1.1).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = retry(&policy, &cancel, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(MycelicError::Unavailable("blip".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry(&policy, &cancel, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MycelicError::invalid("query", "bad")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_short_circuits() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = retry(&policy, &cancel, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(MycelicError::Cancelled)));
    }
}
