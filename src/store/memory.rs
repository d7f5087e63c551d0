//! In-process coordination store.
//!
//! Keeps one keyspace in a `DashMap` with Redis-like value types and
//! deadline-based expiry, plus a broker that fans published messages out to
//! every open subscription. Relay instances sharing one `MemoryStore` behave
//! like instances sharing one Redis.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    BrokerMessage, BrokerSubscription, CoordinationStore, LogEntry, StoreBackend, StoreError,
    StreamId, Subscription,
};

enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Log {
        entries: VecDeque<LogEntry>,
        last_id: StreamId,
    },
    Queue(VecDeque<String>),
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

pub struct MemoryStore {
    data: DashMap<String, Slot>,
    broker: Arc<MemoryBroker>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            broker: Arc::new(MemoryBroker::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every operation fail with `StoreError::Unavailable` (outage simulation).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Remaining time to live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.purge_expired(key);
        self.data
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.data.remove_if(key, |_, slot| slot.is_expired(now));
    }

    fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        self.purge_expired(key);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Text("0".to_string()), ttl));

        match &mut slot.value {
            Value::Text(text) => {
                let next = text
                    .parse::<u64>()
                    .map_err(|_| StoreError::Corrupt(format!("{} is not an integer", key)))?
                    + 1;
                *text = next.to_string();
                Ok(next)
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check()?;
        let hash = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.data
            .insert(key.to_string(), Slot::new(Value::Hash(hash), Some(ttl)));
        Ok(())
    }

    async fn hash_update_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.purge_expired(key);
        match self.data.get_mut(key) {
            Some(mut slot) => match &mut slot.value {
                Value::Hash(hash) => {
                    hash.insert(field.to_string(), value.to_string());
                    Ok(true)
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(false),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check()?;
        self.purge_expired(key);
        match self.data.get(key) {
            Some(slot) => match &slot.value {
                Value::Hash(hash) => Ok(hash.clone()),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.data.insert(
            key.to_string(),
            Slot::new(Value::Text(value.to_string()), Some(ttl)),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.purge_expired(key);
        match self.data.get(key) {
            Some(slot) => match &slot.value {
                Value::Text(text) => Ok(Some(text.clone())),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.purge_expired(key);
        Ok(self.data.remove(key).is_some())
    }

    async fn delete_if_field_equals(
        &self,
        key: &str,
        field: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.purge_expired(key);
        let removed = self.data.remove_if(key, |_, slot| match &slot.value {
            Value::Hash(hash) => hash.get(field).is_some_and(|v| v == expected),
            _ => false,
        });
        Ok(removed.is_some())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        self.check()?;
        self.increment(key, None)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.check()?;
        self.increment(key, Some(ttl))
    }

    async fn log_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
        max_len: usize,
        ttl: Duration,
    ) -> Result<StreamId, StoreError> {
        self.check()?;
        self.purge_expired(key);
        let mut slot = self.data.entry(key.to_string()).or_insert_with(|| {
            Slot::new(
                Value::Log {
                    entries: VecDeque::new(),
                    last_id: StreamId::default(),
                },
                None,
            )
        });

        let id = match &mut slot.value {
            Value::Log { entries, last_id } => {
                let id = last_id.next_after(now_ms());
                *last_id = id;
                entries.push_back(LogEntry {
                    id,
                    fields: fields
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect(),
                });
                while entries.len() > max_len.max(1) {
                    entries.pop_front();
                }
                id
            }
            _ => return Err(StoreError::WrongType(key.to_string())),
        };

        slot.expires_at = Some(Instant::now() + ttl);
        Ok(id)
    }

    async fn log_range_after(
        &self,
        key: &str,
        after: Option<StreamId>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.check()?;
        self.purge_expired(key);
        match self.data.get(key) {
            Some(slot) => match &slot.value {
                Value::Log { entries, .. } => Ok(entries
                    .iter()
                    .filter(|entry| after.map_or(true, |cursor| entry.id > cursor))
                    .cloned()
                    .collect()),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn queue_push(&self, key: &str, value: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.check()?;
        self.purge_expired(key);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Queue(VecDeque::new()), None));

        let len = match &mut slot.value {
            Value::Queue(items) => {
                items.push_back(value.to_string());
                items.len() as u64
            }
            _ => return Err(StoreError::WrongType(key.to_string())),
        };

        slot.expires_at = Some(Instant::now() + ttl);
        Ok(len)
    }

    async fn queue_take_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.purge_expired(key);
        match self
            .data
            .remove_if(key, |_, slot| matches!(slot.value, Value::Queue(_)))
        {
            Some((_, Slot {
                value: Value::Queue(items),
                ..
            })) => Ok(items.into_iter().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None if self.data.contains_key(key) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn queue_peek_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.purge_expired(key);
        match self.data.get(key) {
            Some(slot) => match &slot.value {
                Value::Queue(items) => Ok(items.iter().cloned().collect()),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn queue_len(&self, key: &str) -> Result<u64, StoreError> {
        self.check()?;
        self.purge_expired(key);
        match self.data.get(key) {
            Some(slot) => match &slot.value {
                Value::Queue(items) => Ok(items.len() as u64),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(0),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.broker.publish(channel, payload))
    }

    async fn open_subscription(&self) -> Result<Subscription, StoreError> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.broker.attach(tx);
        let handle = MemorySubscription {
            id,
            broker: self.broker.clone(),
        };
        Ok((Arc::new(handle), rx))
    }
}

struct Subscriber {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Default)]
struct MemoryBroker {
    next_id: AtomicU64,
    subscribers: DashMap<u64, Subscriber>,
}

impl MemoryBroker {
    fn attach(&self, tx: mpsc::UnboundedSender<BrokerMessage>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id,
            Subscriber {
                channels: HashSet::new(),
                tx,
            },
        );
        id
    }

    fn publish(&self, channel: &str, payload: &str) -> u64 {
        let targets: Vec<_> = self
            .subscribers
            .iter()
            .filter(|sub| sub.channels.contains(channel))
            .map(|sub| sub.tx.clone())
            .collect();

        targets
            .into_iter()
            .filter(|tx| {
                tx.send(BrokerMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
            })
            .count() as u64
    }
}

struct MemorySubscription {
    id: u64,
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    async fn subscribe(&self, channel: &str) -> Result<(), StoreError> {
        let mut sub = self
            .broker
            .subscribers
            .get_mut(&self.id)
            .ok_or(StoreError::SubscriptionClosed)?;
        sub.channels.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        if let Some(mut sub) = self.broker.subscribers.get_mut(&self.id) {
            sub.channels.remove(channel);
        }
        Ok(())
    }

    async fn close(&self) {
        self.broker.subscribers.remove(&self.id);
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.broker.subscribers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_hash_replace_and_update() {
        let store = MemoryStore::new();
        store
            .hash_set("h", &[("a", "1".to_string()), ("b", "2".to_string())], HOUR)
            .await
            .unwrap();
        store
            .hash_set("h", &[("a", "3".to_string())], HOUR)
            .await
            .unwrap();

        let hash = store.hash_get_all("h").await.unwrap();
        assert_eq!(hash.get("a").map(String::as_str), Some("3"));
        assert!(!hash.contains_key("b"));

        assert!(store.hash_update_field("h", "c", "4").await.unwrap());
        assert!(!store.hash_update_field("missing", "c", "4").await.unwrap());
        assert!(store.hash_get_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::new();
        store
            .hash_set("s", &[("owner", "x".to_string())], HOUR)
            .await
            .unwrap();

        assert!(!store.delete_if_field_equals("s", "owner", "y").await.unwrap());
        assert!(store.delete_if_field_equals("s", "owner", "x").await.unwrap());
        assert!(store.hash_get_all("s").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_with_expiry_sets_ttl_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_with_expiry("c", ttl).await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.incr_with_expiry("c", ttl).await.unwrap(), 2);

        // TTL was not refreshed by the second increment
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.incr_with_expiry("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_log_ids_increase_and_trim() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = store
                .log_append("log", &[("n", i.to_string())], 3, HOUR)
                .await
                .unwrap();
            ids.push(id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let all = store.log_range_after("log", None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].field("n"), Some("2"));

        let after = store.log_range_after("log", Some(ids[3])).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, ids[4]);
    }

    #[tokio::test]
    async fn test_queue_is_fifo_and_take_clears() {
        let store = MemoryStore::new();
        for item in ["a", "b", "c"] {
            store.queue_push("q", item, HOUR).await.unwrap();
        }
        assert_eq!(store.queue_len("q").await.unwrap(), 3);
        assert_eq!(store.queue_peek_all("q").await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.queue_take_all("q").await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.queue_len("q").await.unwrap(), 0);
        assert!(store.queue_take_all("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", HOUR).await.unwrap();
        assert!(matches!(
            store.queue_take_all("k").await,
            Err(StoreError::WrongType(_))
        ));
        assert!(matches!(
            store.hash_get_all("k").await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn test_pubsub_delivers_to_subscribed_channels_only() {
        let store = MemoryStore::new();
        let (sub, mut rx) = store.open_subscription().await.unwrap();
        sub.subscribe("user:1").await.unwrap();

        assert_eq!(store.publish("user:1", "hello").await.unwrap(), 1);
        assert_eq!(store.publish("user:2", "nobody").await.unwrap(), 0);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "user:1");
        assert_eq!(msg.payload, "hello");

        sub.unsubscribe("user:1").await.unwrap();
        assert_eq!(store.publish("user:1", "again").await.unwrap(), 0);

        sub.close().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.incr("c").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert_eq!(store.incr("c").await.unwrap(), 1);
    }
}
