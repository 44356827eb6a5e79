use chrono::{DateTime, Utc};
use std::time::Duration;

/// Ordered backoff schedule between failed attempts.
///
/// The n-th failure waits `delays[n - 1]`; failures past the end of the
/// schedule reuse the final delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// An empty schedule means "retry immediately".
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Delay after the given number of attempts have been made (1-based).
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let index = usize::try_from(attempts.max(1) - 1).unwrap_or(0);
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn next_retry_at(&self, attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(attempts))
            .unwrap_or_else(|_| chrono::Duration::zero());
        now + delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(&[30, 120, 600])
    }
}
