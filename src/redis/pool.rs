//! Command connection for the Redis store.
//!
//! Commands share one multiplexed connection, opened lazily and dropped on
//! connection-level errors so the next command reconnects. Pub/sub needs a
//! connection of its own (see `store::redis_broker`).

use std::future::Future;
use std::sync::Arc;

use redis::aio::{MultiplexedConnection, PubSub};
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

use super::{CircuitBreaker, CircuitState, RedisHealth};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

pub struct RedisPool {
    client: Client,
    shared: RwLock<Option<MultiplexedConnection>>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<RedisHealth>,
    url: String,
}

impl RedisPool {
    /// Parses the URL only; nothing is dialled until the first command.
    pub fn new(
        config: &RedisConfig,
        breaker: Arc<CircuitBreaker>,
        health: Arc<RedisHealth>,
    ) -> Result<Self, PoolError> {
        Ok(Self {
            client: Client::open(config.url.as_str())?,
            shared: RwLock::new(None),
            breaker,
            health,
            url: config.url.clone(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.breaker.allow_request() {
            self.health.set_circuit_open();
            return Err(PoolError::CircuitOpen);
        }

        if let Some(conn) = self.shared.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut slot = self.shared.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        self.health.set_reconnecting();
        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                tracing::info!(url = %self.url, "Redis command connection established");
                self.breaker.record_success();
                self.health.set_connected();
                *slot = Some(conn.clone());
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to Redis");
                self.breaker.record_failure();
                Err(e.into())
            }
        }
    }

    /// Run one command (or pipeline) on the shared connection.
    pub async fn execute<F, Fut, T>(&self, command: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;

        let result = command(conn).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    self.shared.write().await.take();
                    self.health.set_reconnecting();
                }
                self.breaker.record_failure();
            }
        }
        Ok(result?)
    }

    /// A dedicated connection for SUBSCRIBE.
    pub async fn pubsub(&self) -> Result<PubSub, PoolError> {
        Ok(self.client.get_async_pubsub().await?)
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn health(&self) -> &Arc<RedisHealth> {
        &self.health
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
