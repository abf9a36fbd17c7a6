//! Exponential backoff for operations outside the reconcile loop.
//!
//! Reconciliation itself never retries internally: a failed pass is handed
//! back to the controller runtime, which requeues the machine. This module is
//! for the few calls made before the controllers start (API server readiness
//! at startup), where there is no work queue to fall back on.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff schedule for startup operations
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = retry forever)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Bounded schedule with the default delays
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Un-jittered delay after `attempt` failures (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
///
/// Each delay is the schedule's base delay scaled by a random factor in
/// `[0.5, 1.5)` so that many operators restarting together do not hit the
/// API server in lockstep.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %err, "giving up");
            return Err(err);
        }

        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        let delay = config.base_delay(attempt).mul_f64(jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_base_delay_grows_then_caps() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(config.base_delay(1), Duration::from_millis(100));
        assert_eq!(config.base_delay(2), Duration::from_millis(200));
        assert_eq!(config.base_delay(3), Duration::from_millis(400));
        assert_eq!(config.base_delay(4), Duration::from_millis(500));
        assert_eq!(config.base_delay(1000), Duration::from_millis(500));
    }

    /// Story: the API server is still starting when the operator boots.
    /// Time is paused, so the real default schedule runs instantly.
    #[tokio::test(start_paused = true)]
    async fn story_api_server_comes_up_after_two_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let started = tokio::time::Instant::now();

        let result: Result<&str, String> =
            retry_with_backoff(&RetryConfig::default(), "apiserver", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection refused".to_string())
                    } else {
                        Ok("v1.32.0")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("v1.32.0"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // 250ms then 500ms, each jittered by [0.5, 1.5); timers round up to 1ms
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(375), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(1127), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), String> =
            retry_with_backoff(&RetryConfig::with_max_attempts(3), "apiserver", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Err(format!("attempt {}", n + 1))
                }
            })
            .await;

        assert_eq!(result, Err("attempt 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_stop_growing_at_the_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let config = RetryConfig::with_max_attempts(12);
        let started = tokio::time::Instant::now();

        let _: Result<(), String> = retry_with_backoff(&config, "apiserver", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("connection refused".to_string())
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 12);
        let ceiling: Duration = (1..12).map(|a| config.base_delay(a).mul_f64(1.5)).sum();
        assert!(started.elapsed() <= ceiling + Duration::from_millis(11));
    }
}
