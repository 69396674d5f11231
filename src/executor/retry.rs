// Per-host retry with exponential backoff

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::CommandResult;
use crate::config::EngineConfig;
use crate::output::errors::{BatchError, Result};
use crate::store::BatchSpec;

/// Calculate the wait before retry number `retry` (1-based):
/// `base * multiplier^(retry - 1)`, capped at `max`
pub fn calculate_delay(base: Duration, multiplier: f64, retry: u32, max: Duration) -> Duration {
    let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = base.as_secs_f64() * multiplier.powi(exponent);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Final result of one host's attempt sequence
#[derive(Debug)]
pub struct RetryOutcome {
    /// The last attempt's result
    pub result: Result<CommandResult>,
    /// Attempts actually started, at most `max_retries + 1`
    pub attempts: u32,
}

/// Bounded retry for a single host, independent of every other host
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    retry_on_failure: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
            multiplier: 1.5,
            max_delay: Duration::from_secs(600),
            retry_on_failure: false,
        }
    }

    pub fn from_spec(spec: &BatchSpec, config: &EngineConfig) -> Self {
        // Out-of-range delays are rejected at validation; clamp anything else
        let base_delay = Duration::try_from_secs_f64(spec.retry_delay_secs)
            .unwrap_or(config.max_retry_delay())
            .min(config.max_retry_delay());
        RetryPolicy::new(spec.retry_count, base_delay)
            .with_multiplier(config.backoff_multiplier)
            .with_max_delay(config.max_retry_delay())
            .with_retry_on_failure(spec.retry_on_failure)
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    /// Also retry commands that exit non-zero
    pub fn with_retry_on_failure(mut self, retry: bool) -> Self {
        self.retry_on_failure = retry;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        calculate_delay(self.base_delay, self.multiplier, retry, self.max_delay)
    }

    fn should_retry(&self, result: &Result<CommandResult>) -> bool {
        match result {
            Ok(output) => !output.success() && self.retry_on_failure,
            Err(e) => e.is_retryable(),
        }
    }

    /// Run `attempt` until it succeeds, fails terminally, or attempts run
    /// out. `attempt` receives the 1-based attempt number. Cancellation
    /// interrupts both a running attempt and the backoff wait.
    pub async fn execute<F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<CommandResult>>,
    {
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(BatchError::Cancelled),
                    attempts,
                };
            }

            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BatchError::Cancelled),
                result = attempt(attempts) => result,
            };

            if matches!(result, Err(BatchError::Cancelled))
                || attempts >= self.max_attempts()
                || !self.should_retry(&result)
            {
                return RetryOutcome { result, attempts };
            }

            let delay = self.delay_for(attempts);
            warn!(
                attempt = attempts,
                max_attempts = self.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %describe(&result),
                "attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(BatchError::Cancelled),
                        attempts,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn describe(result: &Result<CommandResult>) -> String {
    match result {
        Ok(output) => format!("exit status {}", output.exit_code),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn ok(code: i32) -> Result<CommandResult> {
        Ok(CommandResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: code,
        })
    }

    fn refused() -> Result<CommandResult> {
        Err(BatchError::connection("h", "connection refused"))
    }

    #[test]
    fn test_exponential_backoff() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);

        assert_eq!(calculate_delay(base, 1.5, 1, max), Duration::from_secs(2));
        assert_eq!(calculate_delay(base, 1.5, 2, max), Duration::from_secs(3));
        assert_eq!(calculate_delay(base, 1.5, 3, max), Duration::from_secs_f64(4.5));
        // Should cap at max
        assert_eq!(calculate_delay(base, 1.5, 40, max), max);
    }

    #[test]
    fn test_policy_from_spec_clamps_delay() {
        let mut spec = crate::store::ExecutionRequest::new("u", "true")
            .with_hosts(["1"])
            .with_retries(2, 2.0)
            .validate()
            .unwrap();
        let config = EngineConfig::default();

        let policy = RetryPolicy::from_spec(&spec, &config);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));

        // A delay that cannot be represented falls back to the cap
        spec.retry_delay_secs = 1e20;
        let policy = RetryPolicy::from_spec(&spec, &config);
        assert_eq!(policy.delay_for(1), config.max_retry_delay());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_errors_use_all_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let outcome = policy
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { refused() }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(outcome.result, Err(BatchError::Connection { .. })));
        // 5s + 7.5s of backoff
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(12_500), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(13), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_retrying() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let outcome = policy
            .execute(&CancellationToken::new(), |n| async move {
                if n < 2 {
                    refused()
                } else {
                    ok(0)
                }
            })
            .await;

        assert_eq!(outcome.attempts, 2);
        assert!(outcome.result.unwrap().success());
    }

    #[tokio::test]
    async fn test_nonzero_exit_not_retried_by_default() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let outcome = policy
            .execute(&CancellationToken::new(), |_| async { ok(1) })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap().exit_code, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_retried_when_enabled() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1)).with_retry_on_failure(true);
        let outcome = policy
            .execute(&CancellationToken::new(), |_| async { ok(2) })
            .await;
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.result.unwrap().exit_code, 2);
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_secs(30));
        let outcome = policy
            .execute(&CancellationToken::new(), |_| async {
                Err(BatchError::CommandTimeout {
                    host: "h".into(),
                    timeout_secs: 1,
                })
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(BatchError::CommandTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let counter = calls.clone();
        let outcome = policy
            .execute(&cancel, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { refused() }
            })
            .await;

        assert!(matches!(outcome.result, Err(BatchError::Cancelled)));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_already_cancelled_runs_nothing() {
        let policy = RetryPolicy::new(1, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = policy.execute(&cancel, |_| async { ok(0) }).await;
        assert_eq!(outcome.attempts, 0);
        assert!(matches!(outcome.result, Err(BatchError::Cancelled)));
    }
}
