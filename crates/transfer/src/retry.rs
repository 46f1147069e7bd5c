use std::future::Future;
use std::time::Duration;

use pcs_remote::RemoteError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::TransferError;

/// Bounded exponential backoff for chunk-level remote calls.
///
/// Only [`RemoteError::Transient`] is retried; every other error, and the
/// last transient one once attempts run out, is returned as is.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests and benchmarks.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Calculates the delay after failed attempt `attempt` (1-based),
    /// with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }

    /// Runs `op` until it succeeds, fails permanently, runs out of attempts
    /// or `cancel` fires. `what` names the operation in logs.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                r = op() => r,
            };

            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.initial_delay, Duration::from_millis(200));
        assert_eq!(p.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn delay_backoff_with_jitter() {
        let p = RetryPolicy::default();
        // Base delays: 200ms, 400ms, 800ms, 1.6s, 3.2s, 5s (capped), 5s...
        let expected = [0.2, 0.4, 0.8, 1.6, 3.2, 5.0, 5.0];
        for (i, &base) in expected.iter().enumerate() {
            let secs = p.delay_for_attempt((i + 1) as u32).as_secs_f64();
            assert!(
                secs >= base * 0.74 && secs <= base * 1.26,
                "attempt {}: {secs} not near {base}",
                i + 1
            );
        }
    }

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = counter();
        let c = calls.clone();
        let out = RetryPolicy::default()
            .run("op", &CancellationToken::new(), || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RemoteError::Transient("reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = counter();
        let c = calls.clone();
        let err = RetryPolicy::default()
            .run("op", &CancellationToken::new(), || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::Transient("timeout".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Remote(RemoteError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = counter();
        let c = calls.clone();
        let err = RetryPolicy::default()
            .run("op", &CancellationToken::new(), || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::Auth("expired".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Remote(RemoteError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = RetryPolicy::default()
            .run("op", &cancel, || async {
                std::future::pending::<Result<(), RemoteError>>().await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
