//! Pacing for gateway request retries.
//!
//! A request is sent at most `max_attempts` times. The wait before each resend grows
//! geometrically from `initial_interval` and is clamped to `maximum_interval`; a wait the gateway
//! asks for (`x-ms-retry-after-ms`, `Retry-After`) wins when it fits inside those bounds.
use std::time;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Growth factor of the wait between consecutive resends.
    pub backoff_coefficient: u32,
    /// Wait before the first resend.
    pub initial_interval: time::Duration,
    /// Upper bound on any wait.
    pub maximum_interval: Option<time::Duration>,
    /// How many times a request is sent at most, the first attempt included.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Wait before resending after the `attempt`-th send failed (1-based).
    ///
    /// `gateway_hint` is honoured when `backoff <= gateway_hint <= maximum_interval`.
    pub fn retry_interval(
        &self,
        attempt: u32,
        gateway_hint: Option<time::Duration>,
    ) -> time::Duration {
        let backoff = self.backoff(attempt);

        match (gateway_hint, self.maximum_interval) {
            (Some(hint), Some(ceiling)) => {
                let floor = backoff.min(ceiling);
                if floor <= hint && hint <= ceiling {
                    hint
                } else {
                    floor
                }
            }
            (Some(hint), None) => backoff.max(hint),
            (None, Some(ceiling)) => backoff.min(ceiling),
            (None, None) => backoff,
        }
    }

    /// Whether another send may follow the `attempt`-th one (1-based).
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Unclamped geometric backoff; saturates instead of overflowing on large attempt numbers.
    fn backoff(&self, attempt: u32) -> time::Duration {
        let saturated = self.maximum_interval.unwrap_or(time::Duration::MAX);
        self.backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(saturated)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Assembles a [`RetryPolicy`], starting from three sends 100ms apart, doubling, capped at 5s.
pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
    max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(5)),
            max_attempts: 3,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Zero is treated as one: a request is always sent once.
    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}
