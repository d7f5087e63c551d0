//! Fixed-window rate limiting of senders.
//!
//! Each sender gets one counter per window, keyed by
//! `floor(now / window)` and expiring with the window. Counters are shared
//! through the coordination store so every relay instance enforces the same
//! budget. Bursts of up to twice the limit across a window boundary are
//! accepted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::RateLimitConfig;
use crate::metrics::RateLimitMetrics;
use crate::store::{keys, CoordinationStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { count: u64, remaining: u64 },
    Denied { retry_after: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    max: u64,
    window_seconds: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            max: config.max,
            window_seconds: config.window_seconds.max(1),
        }
    }

    pub async fn check(&self, sender: &str) -> Result<RateDecision, StoreError> {
        self.check_at(sender, Utc::now().timestamp().max(0) as u64)
            .await
    }

    /// Count one request from `sender` at `now_secs` (Unix seconds).
    pub async fn check_at(&self, sender: &str, now_secs: u64) -> Result<RateDecision, StoreError> {
        let window = now_secs / self.window_seconds;
        let count = self
            .store
            .incr_with_expiry(
                &keys::rate_window(sender, window),
                Duration::from_secs(self.window_seconds),
            )
            .await?;

        if count > self.max {
            RateLimitMetrics::record_denied();
            let retry_after = self.window_seconds - now_secs % self.window_seconds;
            tracing::debug!(user_id = %sender, count, retry_after, "Rate limit exceeded");
            return Ok(RateDecision::Denied { retry_after });
        }

        RateLimitMetrics::record_allowed();
        Ok(RateDecision::Allowed {
            count,
            remaining: self.max - count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(max: u64, window_seconds: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            &RateLimitConfig {
                max,
                window_seconds,
            },
        )
    }

    #[tokio::test]
    async fn test_allows_up_to_max() {
        let limiter = limiter(3, 60);
        for expected in 1..=3 {
            match limiter.check_at("alice", 120).await.unwrap() {
                RateDecision::Allowed { count, remaining } => {
                    assert_eq!(count, expected);
                    assert_eq!(remaining, 3 - expected);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(!limiter.check_at("alice", 121).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_retry_after_is_time_to_boundary() {
        let limiter = limiter(1, 60);
        limiter.check_at("alice", 150).await.unwrap();
        assert_eq!(
            limiter.check_at("alice", 150).await.unwrap(),
            RateDecision::Denied { retry_after: 30 }
        );
        // Exactly on a boundary the whole window remains
        limiter.check_at("bob", 180).await.unwrap();
        assert_eq!(
            limiter.check_at("bob", 180).await.unwrap(),
            RateDecision::Denied { retry_after: 60 }
        );
    }

    #[tokio::test]
    async fn test_new_window_resets() {
        let limiter = limiter(1, 60);
        assert!(limiter.check_at("alice", 59).await.unwrap().is_allowed());
        assert!(!limiter.check_at("alice", 59).await.unwrap().is_allowed());
        assert!(limiter.check_at("alice", 60).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_senders_are_independent() {
        let limiter = limiter(1, 60);
        assert!(limiter.check_at("alice", 10).await.unwrap().is_allowed());
        assert!(limiter.check_at("bob", 10).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_check_uses_current_window() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(
            store.clone(),
            &RateLimitConfig {
                max: 5,
                window_seconds: 60,
            },
        );
        let window = Utc::now().timestamp() as u64 / 60;
        limiter.check("alice").await.unwrap();

        // Only fails if the minute rolled over between the two reads
        let current = store.get(&keys::rate_window("alice", window)).await.unwrap();
        let next = store.get(&keys::rate_window("alice", window + 1)).await.unwrap();
        assert!(current.or(next).is_some());
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), &RateLimitConfig::default());
        store.set_available(false);
        assert!(limiter.check("alice").await.is_err());
    }
}
