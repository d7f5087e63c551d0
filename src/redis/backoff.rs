//! Capped exponential backoff with jitter, used between reconnect attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::RedisConfig;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 3_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&RedisConfig> for BackoffConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            initial_delay_ms: config.backoff_initial_delay_ms,
            max_delay_ms: config.backoff_max_delay_ms,
            ..Default::default()
        }
    }
}

pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt. The first call returns roughly the
    /// initial delay; each further call multiplies it until the cap.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(32) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let base = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay_ms as f64);

        let delay = if self.config.jitter_factor > 0.0 {
            let spread = capped * self.config.jitter_factor;
            capped + rand::rng().random_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_millis(delay.clamp(1.0, self.config.max_delay_ms.max(1) as f64) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial: u64, max: u64) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = ExponentialBackoff::new(no_jitter(100, 10_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut backoff = ExponentialBackoff::new(no_jitter(1_000, 3_000));
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_millis(3_000));
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(3_000));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(no_jitter(50, 1_000));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= Duration::from_millis(3_000));
        }
    }
}
