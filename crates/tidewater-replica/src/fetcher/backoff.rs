//! Exponential backoff for failed fetches.

use crate::config::FetcherConfig;
use std::time::Duration;

/// Backoff settings
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay after a failure
    pub initial_delay: Duration,

    /// Upper bound on the delay before jitter
    pub max_delay: Duration,

    /// Backoff multiplier
    pub multiplier: f32,

    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f32,
}

impl From<&FetcherConfig> for BackoffConfig {
    fn from(config: &FetcherConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.backoff_initial_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            multiplier: config.backoff_multiplier,
            jitter_factor: config.backoff_jitter,
        }
    }
}

/// Unbounded exponential backoff; the fetch loop retries until shut down.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next retry
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        let exponent = (self.attempt - 1).min(31) as i32;
        let base_ms = self.config.initial_delay.as_millis() as f32
            * self.config.multiplier.powi(exponent);
        let capped = Duration::from_millis(base_ms as u64).min(self.config.max_delay);

        let jitter = if self.config.jitter_factor > 0.0 {
            let jitter_ms = (capped.as_millis() as f32 * self.config.jitter_factor) as u64;
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        capped + jitter
    }

    /// Start over after a successful fetch
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let mut backoff = ExponentialBackoff::new(config());
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = ExponentialBackoff::new(config());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            jitter_factor: 0.5,
            ..config()
        });
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(1500));
        }
    }
}
