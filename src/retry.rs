use std::future::Future;
use std::time::Duration;

use log::warn;

/// Exponential backoff shared by every remote call that may be retried.
///
/// Attempt `n` (1-based) that fails transiently is followed by a sleep of
/// `base_delay * factor^(n-1)`, capped at `max_delay`. At most
/// `1 + max_retries` attempts are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Last error of a retried operation together with how many attempts ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        what: &str,
        mut op: F,
        is_transient: P,
    ) -> std::result::Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < max_attempts && is_transient(&error) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{what} failed ({error}), retrying in {}ms ({}/{})...",
                        delay.as_millis(),
                        attempt,
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                    })
                }
            }
        }
    }
}
