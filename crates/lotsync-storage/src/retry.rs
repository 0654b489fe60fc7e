//! Bounded retry with a fixed interval and a total-elapsed ceiling.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Called with `(attempt, error)` before every retry. Its own failure is
/// logged and ignored.
pub type RetryObserver<E> = dyn Fn(u32, &E) -> anyhow::Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub total_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::production()
    }
}

impl RetryPolicy {
    pub fn production() -> Self {
        Self {
            max_attempts: 20,
            interval: Duration::from_secs(720),
            total_timeout: Duration::from_secs(4 * 60 * 60),
        }
    }

    /// Tight profile for CI: three attempts five seconds apart, with a ceiling
    /// that leaves room for every attempt to hit the HTTP timeout.
    pub fn testing(http_timeout: Duration) -> Self {
        let max_attempts = 3;
        let interval = Duration::from_secs(5);
        Self {
            max_attempts,
            interval,
            total_timeout: Self::ceiling_for(max_attempts, interval, http_timeout),
        }
    }

    pub fn ceiling_for(max_attempts: u32, interval: Duration, http_timeout: Duration) -> Duration {
        http_timeout.saturating_mul(max_attempts)
            + interval.saturating_mul(max_attempts.saturating_sub(1))
    }

    /// Retry every failure.
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(label, |_| RetryDisposition::Retryable, None, op)
            .await
    }

    /// Retry failures `classify` marks retryable, notifying `observer` before
    /// each new attempt.
    pub async fn run_with<T, E, F, Fut, C>(
        &self,
        label: &str,
        classify: C,
        observer: Option<&RetryObserver<E>>,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Display,
        C: Fn(&E) -> RetryDisposition,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 1u32;

        loop {
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(label, attempt, "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if classify(&err) == RetryDisposition::NonRetryable {
                return Err(err);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.total_timeout {
                error!(
                    label,
                    elapsed_secs = elapsed.as_secs(),
                    ceiling_secs = self.total_timeout.as_secs(),
                    error = %err,
                    "retry ceiling exceeded"
                );
                return Err(err);
            }
            if attempt >= max_attempts {
                error!(label, attempts = max_attempts, error = %err, "all retry attempts failed");
                return Err(err);
            }

            warn!(
                label,
                attempt,
                max_attempts,
                retry_in_ms = self.interval.as_millis() as u64,
                error = %err,
                "attempt failed; retrying"
            );
            if let Some(observer) = observer {
                if let Err(observer_err) = observer(attempt, &err) {
                    warn!(label, error = %observer_err, "retry observer failed");
                }
            }

            tokio::time::sleep(self.interval).await;
            attempt += 1;
        }
    }
}
