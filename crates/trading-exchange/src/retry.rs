//! Bounded exponential backoff for transient exchange failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use trading_core::error::ExchangeError;

/// Retry settings for one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter, 0.25 = ±25%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `min(base × 2^attempt, cap)` before jitter; `attempt` counts from 0.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. A rate-limit response waits at least as long as
    /// the exchange asked.
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.run_when(operation, ExchangeError::is_transient, op).await
    }

    /// Like [`RetryPolicy::run`], retrying only errors `retryable` accepts.
    pub async fn run_when<T, F, Fut, P>(&self, operation: &str, retryable: P, mut op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
        P: Fn(&ExchangeError) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt + 1 < attempts => {
                    let mut delay = self.jittered(self.backoff(attempt));
                    if let ExchangeError::RateLimited { retry_after_ms } = &e {
                        delay = delay.max(Duration::from_millis(*retry_after_ms));
                    }
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient exchange error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 300,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(300));
        assert_eq!(p.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = RetryPolicy {
            jitter: 0.25,
            ..policy()
        };
        for _ in 0..100 {
            let d = p.jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = tokio::time::Instant::now();
        let result = policy()
            .run("test", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExchangeError::Timeout(1000))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy()
            .run("test", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Network("reset".into()))
            })
            .await;

        assert_eq!(result, Err(ExchangeError::Network("reset".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_and_rejects_not_retried() {
        for error in [
            ExchangeError::Authentication("bad key".into()),
            ExchangeError::Rejected { code: Some(-2010), reason: "insufficient balance".into() },
        ] {
            let calls = AtomicU32::new(0);
            let result: Result<(), _> = policy()
                .run("test", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let error = error.clone();
                    async move { Err(error) }
                })
                .await;
            assert_eq!(result, Err(error));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_when_limits_retries_to_accepted_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy()
            .run_when(
                "submit",
                |e| matches!(e, ExchangeError::RateLimited { .. }),
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::Timeout(100))
                },
            )
            .await;

        assert_eq!(result, Err(ExchangeError::Timeout(100)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_retry_after() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = tokio::time::Instant::now();
        let result = policy()
            .run("test", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExchangeError::RateLimited { retry_after_ms: 2_000 })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_millis(2_000));
    }
}
