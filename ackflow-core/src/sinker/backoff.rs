use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Exponential backoff between delivery attempts of one batch.
///
/// The delay of retry `n` (1-based) is `initial_interval * factor^(n - 1)`, randomized by
/// `jitter` and capped at `max_interval`. The iterator ends after `max_attempts` retries.
#[derive(Debug, Clone)]
pub(crate) struct Exponential {
    initial_interval: Duration,
    max_interval: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: u16,
    attempt: u16,
}

impl Exponential {
    pub(crate) fn new(
        initial_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: u16,
    ) -> Self {
        Self {
            initial_interval,
            max_interval,
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
        }
    }

    /// Retries done so far.
    pub(crate) fn attempt(&self) -> u16 {
        self.attempt
    }

    fn delay(&self, attempt: u16) -> Duration {
        let exponent = i32::from(attempt.max(1) - 1);
        let base_ms = self.initial_interval.as_millis() as f64 * self.factor.powi(exponent);

        let delay_ms = if self.jitter == 0.0 {
            base_ms
        } else {
            base_ms * rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        };

        // guard against f64 overflow before the conversion
        if !delay_ms.is_finite() || delay_ms >= self.max_interval.as_millis() as f64 {
            return self.max_interval;
        }
        Duration::from_millis(delay_ms as u64)
    }
}

impl From<&RetryConfig> for Exponential {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(u64::from(config.initial_interval_ms)),
            Duration::from_millis(u64::from(config.max_interval_ms)),
            config.factor,
            config.jitter,
            config.max_attempts,
        )
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.delay(self.attempt))
    }
}
