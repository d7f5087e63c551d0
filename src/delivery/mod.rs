//! Sending a message from one user to another.
//!
//! Every message is appended to the recipient's event log. If the recipient
//! holds a session anywhere in the cluster the message is published on
//! their channel, otherwise it lands in their offline inbox. The log append
//! and the publish/queue step are separate store operations.

use std::sync::Arc;

use thiserror::Error;

use crate::connection_manager::EventName;
use crate::event::RelayEvent;
use crate::event_log::EventLog;
use crate::inbox::OfflineInbox;
use crate::metrics::{MessageMetrics, StoreMetrics};
use crate::pubsub::PubSubRouter;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::store::{keys, CoordinationStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { event_id: u64, delivered_to: String },
    Queued { event_id: u64 },
}

impl SendOutcome {
    pub fn event_id(&self) -> u64 {
        match self {
            SendOutcome::Delivered { event_id, .. } | SendOutcome::Queued { event_id } => *event_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct DeliveryOrchestrator {
    store: Arc<dyn CoordinationStore>,
    rate_limiter: Arc<RateLimiter>,
    event_log: Arc<EventLog>,
    inbox: Arc<OfflineInbox>,
    pubsub: Arc<PubSubRouter>,
}

impl DeliveryOrchestrator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        rate_limiter: Arc<RateLimiter>,
        event_log: Arc<EventLog>,
        inbox: Arc<OfflineInbox>,
        pubsub: Arc<PubSubRouter>,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            event_log,
            inbox,
            pubsub,
        }
    }

    #[tracing::instrument(skip(self, message), fields(from = %from, to = %to))]
    pub async fn send(&self, from: &str, to: &str, message: &str) -> Result<SendOutcome, SendError> {
        let result = self.try_send(from, to, message).await;
        match &result {
            Ok(SendOutcome::Delivered { .. }) => MessageMetrics::record_send("delivered"),
            Ok(SendOutcome::Queued { .. }) => MessageMetrics::record_send("queued"),
            Err(SendError::RateLimited { .. }) => MessageMetrics::record_send("rate_limited"),
            Err(SendError::Store(e)) => {
                MessageMetrics::record_send("error");
                StoreMetrics::record_error("send");
                tracing::error!(error = %e, "Send failed");
            }
        }
        result
    }

    async fn try_send(&self, from: &str, to: &str, message: &str) -> Result<SendOutcome, SendError> {
        if let RateDecision::Denied { retry_after } = self.rate_limiter.check(from).await? {
            return Err(SendError::RateLimited { retry_after });
        }

        let event_id = self.store.incr(keys::EVENT_COUNTER).await?;
        let mut event = RelayEvent::new(event_id, from, to, message);

        self.event_log
            .append(to, EventName::Message, &event.to_value())
            .await?;

        let session = self.store.hash_get_all(&keys::session(to)).await?;
        match session.get("serverId").filter(|s| !s.is_empty()) {
            Some(server_id) => {
                let receivers = self.pubsub.publish(to, &event).await?;
                tracing::info!(event_id, server_id = %server_id, receivers, "Message published");
                Ok(SendOutcome::Delivered {
                    event_id,
                    delivered_to: server_id.clone(),
                })
            }
            None => {
                event.queued = true;
                let pending = self.inbox.push(to, &event).await?;
                tracing::info!(event_id, pending, "Recipient offline, message queued");
                Ok(SendOutcome::Queued { event_id })
            }
        }
    }
}
