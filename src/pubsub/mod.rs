//! Cross-instance delivery of live messages.
//!
//! Each user with a local connection has a broker channel `user:{userId}`.
//! A consumer task reads the subscription's inbound messages and hands each
//! one to a per-user forwarder, which writes it to the connection in
//! arrival order. A slow client only holds up its own forwarder.

use std::sync::{Arc, Mutex as StdMutex};

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection_manager::{ConnectionRegistry, EventName, WriteOptions};
use crate::event::{payload_event_id, RelayEvent};
use crate::metrics::{MessageMetrics, StoreMetrics};
use crate::store::{keys, BrokerMessage, BrokerSubscription, CoordinationStore, StoreError};

type Forwarders = DashMap<String, mpsc::UnboundedSender<Value>>;

pub struct PubSubRouter {
    store: Arc<dyn CoordinationStore>,
    registry: Arc<ConnectionRegistry>,
    subscription: Arc<dyn BrokerSubscription>,
    subscribed: DashSet<String>,
    forwarders: Arc<Forwarders>,
    consumer: StdMutex<Option<JoinHandle<()>>>,
}

impl PubSubRouter {
    /// Open the broker subscription and start the consumer task.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, StoreError> {
        let (subscription, inbound) = store.open_subscription().await?;
        let forwarders = Arc::new(Forwarders::new());

        let consumer = tokio::spawn(consume(inbound, forwarders.clone()));

        Ok(Self {
            store,
            registry,
            subscription,
            subscribed: DashSet::new(),
            forwarders,
            consumer: StdMutex::new(Some(consumer)),
        })
    }

    /// Start receiving messages for `user_id`. No-op when already subscribed.
    pub async fn subscribe(&self, user_id: &str) -> Result<(), StoreError> {
        if !self.subscribed.insert(user_id.to_string()) {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.forwarders.insert(user_id.to_string(), tx);
        tokio::spawn(forward(self.registry.clone(), user_id.to_string(), rx));

        self.subscription
            .subscribe(&keys::user_channel(user_id))
            .await?;
        tracing::debug!(user_id = %user_id, "Subscribed to user channel");
        Ok(())
    }

    /// Stop receiving messages for `user_id`. Failures are logged only.
    pub async fn unsubscribe(&self, user_id: &str) {
        if self.subscribed.remove(user_id).is_none() {
            return;
        }
        self.forwarders.remove(user_id);

        if let Err(e) = self
            .subscription
            .unsubscribe(&keys::user_channel(user_id))
            .await
        {
            StoreMetrics::record_error("unsubscribe");
            tracing::warn!(user_id = %user_id, error = %e, "Failed to unsubscribe user channel");
        } else {
            tracing::debug!(user_id = %user_id, "Unsubscribed from user channel");
        }
    }

    pub fn is_subscribed(&self, user_id: &str) -> bool {
        self.subscribed.contains(user_id)
    }

    /// Broadcast an event to whichever instance holds the recipient.
    /// Returns the number of subscribers that received it.
    pub async fn publish(&self, user_id: &str, event: &RelayEvent) -> Result<u64, StoreError> {
        let payload =
            serde_json::to_string(event).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.store
            .publish(&keys::user_channel(user_id), &payload)
            .await
    }

    pub async fn shutdown(&self) {
        self.subscription.close().await;
        self.forwarders.clear();
        self.subscribed.clear();
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(consumer) = consumer {
            consumer.abort();
        }
    }
}

async fn consume(mut inbound: mpsc::UnboundedReceiver<BrokerMessage>, forwarders: Arc<Forwarders>) {
    while let Some(message) = inbound.recv().await {
        MessageMetrics::record_pubsub_received();

        let Some(user_id) = keys::user_from_channel(&message.channel) else {
            tracing::debug!(channel = %message.channel, "Ignoring message on unknown channel");
            continue;
        };
        let payload: Value = match serde_json::from_str(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Dropping malformed pub/sub message");
                continue;
            }
        };

        let delivered = forwarders
            .get(user_id)
            .is_some_and(|tx| tx.send(payload).is_ok());
        if !delivered {
            MessageMetrics::record_pubsub_dropped();
            tracing::debug!(user_id = %user_id, "No local connection, dropping message");
        }
    }
    tracing::debug!("Pub/sub consumer stopped");
}

async fn forward(
    registry: Arc<ConnectionRegistry>,
    user_id: String,
    mut rx: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(payload) = rx.recv().await {
        let event_id = payload_event_id(&payload).map(|id| id.to_string());
        let written = registry
            .write_to_client(
                &user_id,
                EventName::Message,
                payload,
                event_id.as_deref(),
                WriteOptions::live(),
            )
            .await;
        if !written {
            MessageMetrics::record_pubsub_dropped();
            tracing::debug!(user_id = %user_id, event_id = ?event_id, "Live message not delivered");
        }
    }
}
