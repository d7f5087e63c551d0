//! Factory function for creating the coordination store

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::Settings;
use crate::redis::{BackoffConfig, CircuitBreaker, CircuitBreakerConfig, RedisHealth, RedisPool};

use super::{CoordinationStore, MemoryStore, RedisStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Redis => "redis",
            StoreBackend::Memory => "memory",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

/// Create the coordination store selected by `store.backend`.
pub fn create_store(settings: &Settings) -> Result<Arc<dyn CoordinationStore>, StoreError> {
    let backend = settings.store.backend.parse::<StoreBackend>().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Falling back to the Redis store");
        StoreBackend::Redis
    });

    match backend {
        StoreBackend::Redis => {
            let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from(
                &settings.redis,
            )));
            let health = Arc::new(RedisHealth::new());
            let pool = Arc::new(RedisPool::new(&settings.redis, circuit_breaker, health)?);

            tracing::info!(url = %pool.url(), "Using Redis coordination store");
            Ok(Arc::new(RedisStore::new(
                pool,
                BackoffConfig::from(&settings.redis),
            )))
        }
        StoreBackend::Memory => {
            tracing::info!("Using in-memory coordination store (single process only)");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("redis".parse::<StoreBackend>(), Ok(StoreBackend::Redis));
        assert_eq!("Memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("postgres".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_create_memory_store() {
        let settings = Settings::for_memory_store("node-a");
        let store = create_store(&settings).unwrap();
        assert_eq!(store.backend(), StoreBackend::Memory);
    }

    #[tokio::test]
    async fn test_create_redis_store_is_lazy() {
        // No connection is attempted until the first command
        let mut settings = Settings::for_memory_store("node-a");
        settings.store.backend = "redis".to_string();
        let store = create_store(&settings).unwrap();
        assert_eq!(store.backend(), StoreBackend::Redis);
    }
}
