//! Shared coordination store.
//!
//! Every piece of cross-instance state (sessions, the event id counter,
//! per-user event logs, offline inboxes, rate windows, liveness markers) and
//! the pub/sub broker sit behind [`CoordinationStore`]. Two backends exist:
//! Redis for production and an in-process store that several relay
//! instances in one process can share.

mod factory;
pub mod keys;
mod memory;
mod redis_broker;
mod redis_store;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::redis::PoolError;

pub use factory::{create_store, StoreBackend};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Key {0} holds a value of another type")]
    WrongType(String),

    #[error("Malformed stored value: {0}")]
    Corrupt(String),

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Pool(PoolError::Redis(e))
    }
}

/// Identifier of an entry in a capped log: milliseconds plus a sequence
/// number, ordered as a pair and written as `ms-seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than `self` that is valid after `now_ms`.
    pub(crate) fn next_after(self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self::new(now_ms, 0)
        } else {
            Self::new(self.ms, self.seq + 1)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid stream id: {0}")]
pub struct ParseStreamIdError(String);

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseStreamIdError(s.to_string());
        let (ms, seq) = s.trim().split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One entry of a capped log, fields in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: StreamId,
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Connection detail of a networked backend, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub status: &'static str,
    pub circuit_breaker: &'static str,
    pub reconnections: u32,
}

/// A message received from the broker on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Channel membership of one broker subscription.
#[async_trait]
pub trait BrokerSubscription: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), StoreError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError>;

    /// Stop delivery; the paired receiver yields `None` afterwards.
    async fn close(&self);
}

pub type Subscription = (
    Arc<dyn BrokerSubscription>,
    mpsc::UnboundedReceiver<BrokerMessage>,
);

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn backend(&self) -> StoreBackend;

    async fn ping(&self) -> Result<(), StoreError>;

    /// `None` for in-process backends.
    fn connection_info(&self) -> Option<ConnectionInfo> {
        None
    }

    // Keys with expiry

    /// Replace the whole hash at `key` and set its TTL.
    async fn hash_set(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Set one field of an existing hash. Returns false when the hash is gone.
    async fn hash_update_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError>;

    /// Empty map when the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically delete the hash at `key` if `field` currently equals `expected`.
    async fn delete_if_field_equals(
        &self,
        key: &str,
        field: &str,
        expected: &str,
    ) -> Result<bool, StoreError>;

    // Counters

    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Increment; the TTL is applied atomically when the counter is created.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    // Capped ordered log

    /// Append an entry, trim the log to roughly `max_len` entries and refresh its TTL.
    async fn log_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
        max_len: usize,
        ttl: Duration,
    ) -> Result<StreamId, StoreError>;

    /// Entries with an id strictly greater than `after`, oldest first.
    /// `None` returns the whole retained log.
    async fn log_range_after(
        &self,
        key: &str,
        after: Option<StreamId>,
    ) -> Result<Vec<LogEntry>, StoreError>;

    // FIFO queue

    /// Append to the tail and refresh the TTL. Returns the new length.
    async fn queue_push(&self, key: &str, value: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Read every item in arrival order and clear the queue in one step.
    async fn queue_take_all(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Read every item in arrival order without removing anything.
    async fn queue_peek_all(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn queue_len(&self, key: &str) -> Result<u64, StoreError>;

    // Pub/sub

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError>;

    async fn open_subscription(&self) -> Result<Subscription, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_parse_and_display() {
        let id: StreamId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, StreamId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");
    }

    #[test]
    fn test_stream_id_rejects_garbage() {
        assert!("abc".parse::<StreamId>().is_err());
        assert!("12".parse::<StreamId>().is_err());
        assert!("12-x".parse::<StreamId>().is_err());
    }

    #[test]
    fn test_stream_id_orders_as_pair() {
        // 999-5 precedes 1000-0 even though "999" > "1000" as text
        let a = StreamId::new(999, 5);
        let b = StreamId::new(1000, 0);
        assert!(a < b);
        assert!(StreamId::new(1000, 1) > b);
    }

    #[test]
    fn test_next_after_handles_same_ms_and_clock_skew() {
        let last = StreamId::new(1000, 4);
        assert_eq!(last.next_after(1001), StreamId::new(1001, 0));
        assert_eq!(last.next_after(1000), StreamId::new(1000, 5));
        assert_eq!(last.next_after(900), StreamId::new(1000, 5));
    }

    #[test]
    fn test_log_entry_field_lookup() {
        let entry = LogEntry {
            id: StreamId::new(1, 0),
            fields: vec![
                ("event".to_string(), "message".to_string()),
                ("data".to_string(), "{}".to_string()),
            ],
        };
        assert_eq!(entry.field("event"), Some("message"));
        assert_eq!(entry.field("missing"), None);
    }
}
