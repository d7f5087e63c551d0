//! Per-user capped log of delivered events, used to replay what a client
//! missed while disconnected.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::StreamConfig;
use crate::connection_manager::{Connection, ConnectionRegistry, EventName, WriteOptions};
use crate::event::payload_event_id;
use crate::metrics::MessageMetrics;
use crate::store::{keys, CoordinationStore, LogEntry, StoreError, StreamId};

/// Position a client resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCursor {
    /// Log entry id, as sent on replayed frames
    Stream(StreamId),
    /// Global event id, as sent on live messages
    Event(u64),
}

impl FromStr for ReplayCursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('-') {
            s.parse()
                .map(ReplayCursor::Stream)
                .map_err(|e| e.to_string())
        } else {
            s.parse()
                .map(ReplayCursor::Event)
                .map_err(|_| format!("invalid replay cursor: {}", s))
        }
    }
}

impl fmt::Display for ReplayCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayCursor::Stream(id) => write!(f, "{}", id),
            ReplayCursor::Event(id) => write!(f, "{}", id),
        }
    }
}

pub struct EventLog {
    store: Arc<dyn CoordinationStore>,
    registry: Arc<ConnectionRegistry>,
    max_len: usize,
    ttl: Duration,
}

impl EventLog {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        registry: Arc<ConnectionRegistry>,
        config: &StreamConfig,
    ) -> Self {
        Self {
            store,
            registry,
            max_len: config.max_len,
            ttl: Duration::from_secs(config.ttl_seconds),
        }
    }

    pub async fn append(
        &self,
        user_id: &str,
        event: EventName,
        data: &Value,
    ) -> Result<StreamId, StoreError> {
        let fields = [
            ("event", event.as_str().to_string()),
            ("data", data.to_string()),
        ];
        self.store
            .log_append(&keys::event_stream(user_id), &fields, self.max_len, self.ttl)
            .await
    }

    /// Entries after `cursor`, oldest first. `None` returns the whole log.
    pub async fn entries_after(
        &self,
        user_id: &str,
        cursor: Option<ReplayCursor>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let key = keys::event_stream(user_id);
        match cursor {
            Some(ReplayCursor::Stream(id)) => self.store.log_range_after(&key, Some(id)).await,
            Some(ReplayCursor::Event(after)) => {
                let entries = self.store.log_range_after(&key, None).await?;
                Ok(entries
                    .into_iter()
                    .filter(|entry| {
                        entry
                            .field("data")
                            .and_then(|data| serde_json::from_str::<Value>(data).ok())
                            .and_then(|data| payload_event_id(&data))
                            .is_some_and(|id| id > after)
                    })
                    .collect())
            }
            None => self.store.log_range_after(&key, None).await,
        }
    }

    /// Write every entry after `cursor` to the user's connection. Stops at
    /// the first write that does not go through. Returns the number written.
    pub async fn replay(
        &self,
        user_id: &str,
        cursor: Option<ReplayCursor>,
    ) -> Result<u64, StoreError> {
        match self.registry.connection(user_id) {
            Some(conn) => self.replay_to(&conn, cursor).await,
            None => Ok(0),
        }
    }

    /// Replay onto a specific connection, which may not be the user's
    /// registered one by the time the writes happen.
    pub async fn replay_to(
        &self,
        conn: &Arc<Connection>,
        cursor: Option<ReplayCursor>,
    ) -> Result<u64, StoreError> {
        self.replay_to_except(conn, cursor, &HashSet::new()).await
    }

    /// Like `replay_to`, leaving out messages whose event id is in `skip`.
    pub async fn replay_to_except(
        &self,
        conn: &Arc<Connection>,
        cursor: Option<ReplayCursor>,
        skip: &HashSet<u64>,
    ) -> Result<u64, StoreError> {
        let user_id = conn.user_id.as_str();
        let entries = self.entries_after(user_id, cursor).await?;
        let mut written = 0;

        for entry in entries {
            let event = entry
                .field("event")
                .and_then(EventName::parse)
                .unwrap_or(EventName::Message);
            let data = match entry.field("data").map(serde_json::from_str::<Value>) {
                Some(Ok(data)) => data,
                _ => {
                    tracing::warn!(user_id = %user_id, entry_id = %entry.id, "Skipping malformed log entry");
                    continue;
                }
            };

            if payload_event_id(&data).is_some_and(|id| skip.contains(&id)) {
                continue;
            }

            let id = entry.id.to_string();
            if !self
                .registry
                .write_to_connection(conn, event, data, Some(&id), WriteOptions::replayed())
                .await
            {
                break;
            }
            written += 1;
        }

        if written > 0 {
            MessageMetrics::record_replayed(written);
            tracing::info!(user_id = %user_id, count = written, "Replayed missed events");
        }
        Ok(written)
    }
}
