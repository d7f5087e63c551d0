//! Redis-backed coordination store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::AsyncCommands;

use crate::redis::{BackoffConfig, RedisPool};

use super::redis_broker;
use super::{
    ConnectionInfo, CoordinationStore, LogEntry, StoreBackend, StoreError, StreamId, Subscription,
};

lazy_static! {
    /// INCR that sets the expiry only when the counter is created.
    static ref INCR_WITH_EXPIRY: redis::Script = redis::Script::new(
        r#"
        local current = redis.call('INCR', KEYS[1])
        if current == 1 then
            redis.call('EXPIRE', KEYS[1], ARGV[1])
        end
        return current
        "#,
    );

    static ref DELETE_IF_FIELD_EQUALS: redis::Script = redis::Script::new(
        r#"
        if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    );

    static ref UPDATE_EXISTING_FIELD: redis::Script = redis::Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 1 then
            redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
            return 1
        end
        return 0
        "#,
    );
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

pub struct RedisStore {
    pool: Arc<RedisPool>,
    backoff: BackoffConfig,
}

impl RedisStore {
    pub fn new(pool: Arc<RedisPool>, backoff: BackoffConfig) -> Self {
        Self { pool, backoff }
    }

    pub fn pool(&self) -> &Arc<RedisPool> {
        &self.pool
    }
}

type RawEntry = (String, Vec<(String, String)>);

fn parse_entries(raw: Vec<RawEntry>) -> Result<Vec<LogEntry>, StoreError> {
    raw.into_iter()
        .map(|(id, fields)| {
            let id = id
                .parse::<StreamId>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            Ok(LogEntry { id, fields })
        })
        .collect()
}

#[async_trait]
impl CoordinationStore for RedisStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(self.pool.ping().await?)
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        let health = self.pool.health();
        Some(ConnectionInfo {
            status: health.status().as_str(),
            circuit_breaker: self.pool.circuit_state().as_str(),
            reconnections: health.reconnections(),
        })
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(key)
            .ignore()
            .hset_multiple(key, fields)
            .ignore()
            .expire(key, ttl_secs(ttl))
            .ignore();

        let _: () = self
            .pool
            .execute(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn hash_update_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let updated: i64 = self
            .pool
            .execute(|mut conn| async move {
                UPDATE_EXISTING_FIELD
                    .key(key)
                    .arg(field)
                    .arg(value)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(updated == 1)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .pool
            .execute(|mut conn| async move { conn.hgetall(key).await })
            .await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.pool
            .execute(|mut conn| async move {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await
            })
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .pool
            .execute(|mut conn| async move { conn.get(key).await })
            .await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: i64 = self
            .pool
            .execute(|mut conn| async move { conn.del(key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn delete_if_field_equals(
        &self,
        key: &str,
        field: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let removed: i64 = self
            .pool
            .execute(|mut conn| async move {
                DELETE_IF_FIELD_EQUALS
                    .key(key)
                    .arg(field)
                    .arg(expected)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .pool
            .execute(|mut conn| async move { conn.incr(key, 1u64).await })
            .await?)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        Ok(self
            .pool
            .execute(|mut conn| async move {
                INCR_WITH_EXPIRY
                    .key(key)
                    .arg(ttl_secs(ttl))
                    .invoke_async(&mut conn)
                    .await
            })
            .await?)
    }

    async fn log_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
        max_len: usize,
        ttl: Duration,
    ) -> Result<StreamId, StoreError> {
        // XADD key MAXLEN ~ max_len * field value ...
        let mut xadd = redis::cmd("XADD");
        xadd.arg(key).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (field, value) in fields {
            xadd.arg(*field).arg(value);
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .add_command(xadd)
            .expire(key, ttl_secs(ttl))
            .ignore();

        let (id,): (String,) = self
            .pool
            .execute(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        id.parse::<StreamId>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn log_range_after(
        &self,
        key: &str,
        after: Option<StreamId>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        // "(" makes the start bound exclusive
        let start = after.map_or_else(|| "-".to_string(), |id| format!("({}", id));

        let raw: Vec<RawEntry> = self
            .pool
            .execute(|mut conn| async move {
                redis::cmd("XRANGE")
                    .arg(key)
                    .arg(&start)
                    .arg("+")
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        parse_entries(raw)
    }

    async fn queue_push(&self, key: &str, value: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .rpush(key, value)
            .expire(key, ttl_secs(ttl))
            .ignore();

        let (len,): (u64,) = self
            .pool
            .execute(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;
        Ok(len)
    }

    async fn queue_take_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic().lrange(key, 0, -1).del(key).ignore();

        let (items,): (Vec<String>,) = self
            .pool
            .execute(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;
        Ok(items)
    }

    async fn queue_peek_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .pool
            .execute(|mut conn| async move { conn.lrange(key, 0, -1).await })
            .await?)
    }

    async fn queue_len(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .pool
            .execute(|mut conn| async move { conn.llen(key).await })
            .await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError> {
        Ok(self
            .pool
            .execute(|mut conn| async move { conn.publish(channel, payload).await })
            .await?)
    }

    async fn open_subscription(&self) -> Result<Subscription, StoreError> {
        Ok(redis_broker::open(self.pool.clone(), self.backoff.clone()))
    }
}
