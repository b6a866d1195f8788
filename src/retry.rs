//! Bounded polling and fixed-attempt retries
//!
//! Two primitives back every external wait in a bootstrap run:
//!
//! - [`poll_until_ready`] probes a condition immediately and then at a fixed
//!   interval until it holds or an overall timeout elapses. There is no
//!   backoff: the interval is the same for the whole wait.
//! - [`retry_with_fixed_delay`] runs an idempotent operation up to a fixed
//!   number of times with a constant delay, returning the last error.
//!
//! # Example
//!
//! ```ignore
//! use lattice_deployer::retry::{poll_until_ready, PollConfig, ProbeErrors};
//!
//! poll_until_ready(
//!     "api server https://35.1.2.3:443",
//!     &PollConfig::default(),
//!     ProbeErrors::Retry,
//!     || async { api.list_pods().await.map(|_| true) },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::{Error, Result};

/// Interval and overall timeout for a readiness wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between probes
    pub interval: Duration,
    /// Overall deadline, measured from the first probe
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(20 * 60),
        }
    }
}

impl PollConfig {
    /// Create a config from an interval and a timeout
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// What a poll does when the probe itself fails
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeErrors {
    /// Treat the error as "not ready yet" and keep polling
    Retry,
    /// Abort the wait and return the error
    Surface,
}

/// Probe until `probe` reports true or the timeout elapses
///
/// The first probe runs immediately. Returns the number of probes made, or
/// [`Error::Timeout`] naming `what` once the deadline has passed.
pub async fn poll_until_ready<F, Fut>(
    what: &str,
    config: &PollConfig,
    errors: ProbeErrors,
    mut probe: F,
) -> Result<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        // A probe that hangs must not outlive the deadline
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Ok(outcome) = tokio::time::timeout(remaining, probe()).await else {
            warn!(
                what = %what,
                attempt,
                timeout_secs = config.timeout.as_secs(),
                "Probe still running at deadline"
            );
            return Err(Error::timeout(what, config.timeout));
        };

        match outcome {
            Ok(true) => {
                debug!(what = %what, attempt, "Condition met");
                return Ok(attempt);
            }
            Ok(false) => {
                debug!(what = %what, attempt, "Condition not yet met");
            }
            Err(e) if errors == ProbeErrors::Surface => {
                error!(what = %what, attempt, error = %e, "Probe failed");
                return Err(e);
            }
            Err(e) => {
                debug!(what = %what, attempt, error = %e, "Probe failed, treating as not ready");
            }
        }

        if Instant::now() >= deadline {
            warn!(what = %what, attempt, timeout_secs = config.timeout.as_secs(), "Gave up waiting");
            return Err(Error::timeout(what, config.timeout));
        }

        tokio::time::sleep(config.interval).await;
    }
}

/// Attempt count and delay for idempotent one-shot operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first (at least 1)
    pub max_attempts: u32,
    /// Delay between attempts
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts and the default delay
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Run an operation up to `max_attempts` times with a fixed delay
///
/// Returns the first success, or the last error once attempts run out.
pub async fn retry_with_fixed_delay<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Operation failed after max attempts"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = config.delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(config.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    // =========================================================================
    // Story: readiness waits take as long as the condition needs, no longer
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_ready_on_first_probe_returns_without_sleeping() {
        let start = Instant::now();
        let attempts = poll_until_ready("ready", &PollConfig::default(), ProbeErrors::Retry, || async {
            Ok(true)
        })
        .await
        .unwrap();

        assert_eq!(attempts, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn story_nth_probe_success_takes_about_n_intervals() {
        let interval = Duration::from_secs(5);
        let config = PollConfig::new(interval, Duration::from_secs(600));
        let calls = counter();
        let c = calls.clone();

        let start = Instant::now();
        let attempts = poll_until_ready("service account", &config, ProbeErrors::Retry, || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) + 1 >= 4) }
        })
        .await
        .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(elapsed >= interval * 3, "returned early: {elapsed:?}");
        assert!(elapsed <= interval * 4, "returned late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn story_always_failing_probe_times_out_never_early() {
        let config = PollConfig::new(Duration::from_secs(5), Duration::from_secs(60));

        let start = Instant::now();
        let err = poll_until_ready("api server https://35.1.2.3:443", &config, ProbeErrors::Retry, || async {
            Ok(false)
        })
        .await
        .unwrap_err();

        assert!(start.elapsed() >= config.timeout);
        assert!(start.elapsed() < config.timeout + config.interval * 2);
        match err {
            Error::Timeout { what, timeout } => {
                assert_eq!(what, "api server https://35.1.2.3:443");
                assert_eq!(timeout, Duration::from_secs(60));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn story_hung_probe_is_cut_off_at_deadline() {
        let config = PollConfig::new(Duration::from_secs(5), Duration::from_secs(60));
        let calls = counter();
        let c = calls.clone();

        let start = Instant::now();
        let err = poll_until_ready("service account", &config, ProbeErrors::Surface, move || {
            let c = c.clone();
            async move {
                // Second probe never answers
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(false)
                } else {
                    std::future::pending::<Result<bool>>().await
                }
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= config.timeout);
        assert!(start.elapsed() < config.timeout + config.interval);
    }

    // =========================================================================
    // Story: callers choose whether probe errors count as "not ready"
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_swallowed_probe_errors_keep_polling() {
        let config = PollConfig::new(Duration::from_millis(500), Duration::from_secs(10));
        let calls = counter();
        let c = calls.clone();

        let attempts = poll_until_ready("resource schema", &config, ProbeErrors::Retry, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::provider("connection refused"))
                } else {
                    Ok(true)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn story_surfaced_probe_error_aborts_wait() {
        let config = PollConfig::new(Duration::from_secs(1), Duration::from_secs(10));
        let calls = counter();
        let c = calls.clone();

        let err = poll_until_ready("machine gone", &config, ProbeErrors::Surface, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<bool, _>(Error::provider("forbidden"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Provider(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Story: one-shot operations get a fixed number of attempts
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: std::result::Result<i32, &str> =
            retry_with_fixed_delay(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures_with_constant_delay() {
        let calls = counter();
        let c = calls.clone();
        let config = RetryConfig {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        };

        let start = Instant::now();
        let result: std::result::Result<i32, &str> =
            retry_with_fixed_delay(&config, "fetch kubeconfig", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_max_attempts_and_returns_last_error() {
        let calls = counter();
        let c = calls.clone();
        let config = RetryConfig {
            max_attempts: 3,
            delay: Duration::from_millis(10),
        };

        let result: std::result::Result<i32, String> =
            retry_with_fixed_delay(&config, "op", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {n}"))
                }
            })
            .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_runs_once() {
        let calls = counter();
        let c = calls.clone();
        let config = RetryConfig {
            max_attempts: 0,
            delay: Duration::from_millis(10),
        };

        let result: std::result::Result<(), &str> = retry_with_fixed_delay(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
