//! Circuit breaker guarding the Redis command connection.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use crate::config::RedisConfig;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    /// Probing: requests pass, one failure reopens
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
        }
    }
}

impl From<&RedisConfig> for CircuitBreakerConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold,
            success_threshold: config.circuit_breaker_success_threshold,
            reset_timeout_ms: config.circuit_breaker_reset_timeout_seconds * 1000,
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    /// Consecutive failures while closed
    failures: AtomicU32,
    /// Consecutive successes while half-open
    successes: AtomicU32,
    opened_at_ms: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
            config,
        }
    }

    /// Current state; an open circuit whose reset timeout elapsed moves to half-open.
    pub fn state(&self) -> CircuitState {
        let raw = CircuitState::from_u8(self.state.load(Ordering::Acquire));
        if raw != CircuitState::Open {
            return raw;
        }

        let elapsed = current_time_ms() - self.opened_at_ms.load(Ordering::Acquire);
        if elapsed < self.config.reset_timeout_ms as i64 {
            return CircuitState::Open;
        }

        if self
            .state
            .compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.successes.store(0, Ordering::Release);
            tracing::info!("Redis circuit breaker half-open, probing");
        }
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        match CircuitState::from_u8(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => self.failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.close();
                    tracing::info!("Redis circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match CircuitState::from_u8(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.open();
                    tracing::warn!(failures, "Redis circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                self.open();
                tracing::warn!("Redis circuit breaker reopened during probe");
            }
            CircuitState::Open => {
                self.opened_at_ms.store(current_time_ms(), Ordering::Release);
            }
        }
    }

    fn open(&self) {
        self.opened_at_ms.store(current_time_ms(), Ordering::Release);
        self.successes.store(0, Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
    }

    fn close(&self) {
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(failures: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: 2,
            reset_timeout_ms: reset_ms,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 1_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(3, 1_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_then_closed() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(
            CircuitState::from_u8(cb.state.load(Ordering::Acquire)),
            CircuitState::Open
        );
    }
}
