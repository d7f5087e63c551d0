//! Redis connectivity: a multiplexed command pool guarded by a circuit
//! breaker, health tracking, and reconnection backoff for the subscriber.

mod backoff;
mod circuit_breaker;
mod health;
mod pool;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use health::{RedisHealth, RedisHealthStatus};
pub use pool::{PoolError, RedisPool};

/// Milliseconds since epoch, for breaker timing
fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
