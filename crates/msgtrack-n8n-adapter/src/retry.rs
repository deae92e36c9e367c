use msgtrack_core::SourceError;
use reqwest::StatusCode;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(600);

pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Result of one attempt: finished, or worth trying again.
pub enum Attempt<T> {
    Done(T),
    Retry(SourceError),
}

/// Exponential backoff: attempt `n` failing waits `base * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Runs `op` until it is done or attempts run out. `on_retry` is told
    /// about every failed attempt that will be retried and is responsible
    /// for waiting out the delay.
    pub fn run<T, Op, Wait>(&self, mut op: Op, mut on_retry: Wait) -> Result<T, SourceError>
    where
        Op: FnMut(u32) -> Attempt<T>,
        Wait: FnMut(u32, Duration, &SourceError),
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(err) if attempt >= attempts => return Err(err),
                Attempt::Retry(err) => {
                    on_retry(attempt, self.delay_for(attempt), &err);
                    attempt += 1;
                }
            }
        }
    }
}
