//! Bounded exponential backoff shared by sender delivery and subscription
//! reconnects.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters. `max_attempts` counts every call, including the first.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts before giving up (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl RetryConfig {
    /// Defaults for outbound notification sends.
    pub fn for_senders() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Defaults for (re)subscribing to the inbound channel.
    pub fn for_subscription() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// No waiting between attempts (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Whether another attempt is allowed after `attempt` calls have been made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let total_ms = if self.jitter && capped_ms > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=capped_ms * 0.25);
            (capped_ms + jitter).min(self.max_delay.as_millis() as f64)
        } else {
            capped_ms
        };

        Duration::from_millis(total_ms as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_senders()
    }
}
