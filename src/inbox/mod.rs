//! Offline inbox: messages for users who had no session when they were
//! sent, held until the user next connects.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::InboxConfig;
use crate::event::RelayEvent;
use crate::store::{keys, CoordinationStore, StoreError};

pub struct OfflineInbox {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
}

impl OfflineInbox {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &InboxConfig) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(config.ttl_seconds),
        }
    }

    /// Append to the user's inbox and refresh its expiry. Returns the new size.
    pub async fn push(&self, user_id: &str, event: &RelayEvent) -> Result<u64, StoreError> {
        let payload =
            serde_json::to_string(event).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.store
            .queue_push(&keys::inbox(user_id), &payload, self.ttl)
            .await
    }

    /// Take every queued message in arrival order, leaving the inbox empty.
    pub async fn flush(&self, user_id: &str) -> Result<Vec<RelayEvent>, StoreError> {
        let raw = self.store.queue_take_all(&keys::inbox(user_id)).await?;
        Ok(decode(user_id, raw))
    }

    /// Ids of the queued messages, leaving the inbox untouched.
    pub async fn pending_ids(&self, user_id: &str) -> Result<HashSet<u64>, StoreError> {
        let raw = self.store.queue_peek_all(&keys::inbox(user_id)).await?;
        Ok(decode(user_id, raw).into_iter().map(|event| event.id).collect())
    }

    pub async fn count(&self, user_id: &str) -> Result<u64, StoreError> {
        self.store.queue_len(&keys::inbox(user_id)).await
    }
}

fn decode(user_id: &str, raw: Vec<String>) -> Vec<RelayEvent> {
    raw.into_iter()
        .filter_map(|item| match serde_json::from_str::<RelayEvent>(&item) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Dropping malformed inbox entry");
                None
            }
        })
        .collect()
}
