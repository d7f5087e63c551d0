use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::payload_event_id;
use crate::metrics::{ConnectionMetrics, MessageMetrics, StoreMetrics};
use crate::store::{keys, CoordinationStore};

use super::frame::{EventName, SseFrame};
use super::types::{Connection, OutboundFrame, WriteOptions};

/// Local connections of this process, one per user, plus their sessions in
/// the coordination store.
pub struct ConnectionRegistry {
    /// user_id -> Connection
    connections: DashMap<String, Arc<Connection>>,
    store: Arc<dyn CoordinationStore>,
    server_id: String,
    session_ttl: Duration,
    cursor_ttl: Duration,
}

impl ConnectionRegistry {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        server_id: impl Into<String>,
        session_ttl: Duration,
        cursor_ttl: Duration,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            store,
            server_id: server_id.into(),
            session_ttl,
            cursor_ttl,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Register a connection and claim the user's session for this process.
    /// A connection already registered for the user is closed.
    pub async fn register(
        &self,
        user_id: &str,
        sender: mpsc::Sender<OutboundFrame>,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(user_id.to_string(), sender));

        if let Some(previous) = self.connections.insert(user_id.to_string(), conn.clone()) {
            previous.mark_replaced();
            ConnectionMetrics::record_replaced();
        }
        ConnectionMetrics::set_active(self.connections.len());

        let fields = [
            ("serverId", self.server_id.clone()),
            ("connectionId", conn.id.to_string()),
            ("connectedAt", conn.connected_at.timestamp_millis().to_string()),
            ("lastEventId", String::new()),
        ];
        if let Err(e) = self
            .store
            .hash_set(&keys::session(user_id), &fields, self.session_ttl)
            .await
        {
            StoreMetrics::record_error("session_register");
            tracing::error!(user_id = %user_id, error = %e, "Failed to write session");
        }

        tracing::info!(
            user_id = %user_id,
            connection_id = %conn.id,
            server_id = %self.server_id,
            "Connection registered"
        );

        conn
    }

    /// Close and forget a local connection without touching its session,
    /// which the replacing connection is about to claim.
    pub fn retire_local(&self, user_id: &str, connection_id: Uuid) -> Option<Arc<Connection>> {
        let (_, conn) = self
            .connections
            .remove_if(user_id, |_, c| c.id == connection_id)?;
        conn.mark_replaced();
        ConnectionMetrics::record_replaced();
        ConnectionMetrics::set_active(self.connections.len());
        tracing::debug!(user_id = %user_id, connection_id = %connection_id, "Connection retired");
        Some(conn)
    }

    /// Close the user's connection and release their session.
    pub async fn unregister(&self, user_id: &str) {
        if let Some((_, conn)) = self.connections.remove(user_id) {
            ConnectionMetrics::set_active(self.connections.len());
            self.release(&conn).await;
        }
    }

    /// Unregister only if `connection_id` is still the user's registered
    /// connection.
    pub async fn unregister_connection(&self, user_id: &str, connection_id: Uuid) -> bool {
        match self
            .connections
            .remove_if(user_id, |_, c| c.id == connection_id)
        {
            Some((_, conn)) => {
                ConnectionMetrics::set_active(self.connections.len());
                self.release(&conn).await;
                true
            }
            None => false,
        }
    }

    async fn release(&self, conn: &Connection) {
        conn.close();

        // Another process or a newer connection may own the session by now
        match self
            .store
            .delete_if_field_equals(
                &keys::session(&conn.user_id),
                "connectionId",
                &conn.id.to_string(),
            )
            .await
        {
            Ok(deleted) => {
                tracing::info!(
                    user_id = %conn.user_id,
                    connection_id = %conn.id,
                    session_deleted = deleted,
                    "Connection unregistered"
                );
            }
            Err(e) => {
                StoreMetrics::record_error("session_delete");
                tracing::error!(user_id = %conn.user_id, error = %e, "Failed to delete session");
            }
        }
    }

    /// Write a frame to the user's local connection. False when the user
    /// has no connection here or the write failed.
    pub async fn write_to_client(
        &self,
        user_id: &str,
        event: EventName,
        data: Value,
        event_id: Option<&str>,
        options: WriteOptions,
    ) -> bool {
        match self.connection(user_id) {
            Some(conn) => {
                self.write_to_connection(&conn, event, data, event_id, options)
                    .await
            }
            None => false,
        }
    }

    pub async fn write_to_connection(
        &self,
        conn: &Arc<Connection>,
        event: EventName,
        mut data: Value,
        event_id: Option<&str>,
        options: WriteOptions,
    ) -> bool {
        if options.live && !conn.wait_live().await {
            return false;
        }

        let message_id = match event {
            EventName::Message => payload_event_id(&data),
            _ => None,
        };
        if let Some(id) = message_id {
            if conn.already_delivered(id) {
                MessageMetrics::record_duplicate_skipped();
                tracing::debug!(user_id = %conn.user_id, event_id = id, "Skipping duplicate message");
                return true;
            }
        }

        if options.replayed {
            if let Value::Object(map) = &mut data {
                map.insert("replayed".to_string(), Value::Bool(true));
            }
        }

        let started = Instant::now();
        if !conn.write(SseFrame::new(event, &data, event_id)).await {
            tracing::debug!(user_id = %conn.user_id, event = event.as_str(), "Write failed, evicting connection");
            self.unregister_connection(&conn.user_id, conn.id).await;
            return false;
        }
        MessageMetrics::record_frame(event.as_str(), started.elapsed());

        if let Some(id) = message_id {
            conn.record_delivered(id);
        }
        if let Some(id) = event_id {
            self.advance_cursor(&conn.user_id, id).await;
        }

        true
    }

    /// Record an acknowledged event id on the session and the resume cursor.
    async fn advance_cursor(&self, user_id: &str, event_id: &str) {
        if let Err(e) = self
            .store
            .hash_update_field(&keys::session(user_id), "lastEventId", event_id)
            .await
        {
            StoreMetrics::record_error("session_last_event_id");
            tracing::warn!(user_id = %user_id, error = %e, "Failed to update lastEventId");
        }
        if let Err(e) = self
            .store
            .set_ex(&keys::resume_cursor(user_id), event_id, self.cursor_ttl)
            .await
        {
            StoreMetrics::record_error("resume_cursor");
            tracing::warn!(user_id = %user_id, error = %e, "Failed to store resume cursor");
        }
    }

    /// Open the user's connection to live traffic.
    pub fn mark_live(&self, user_id: &str) -> bool {
        match self.connection(user_id) {
            Some(conn) => {
                conn.mark_live();
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(user_id).map(|c| c.clone())
    }

    pub fn has(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    pub fn all_user_ids(&self) -> Vec<String> {
        self.connections.iter().map(|r| r.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    fn registry() -> (Arc<MemoryStore>, ConnectionRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new(store.clone(), "node-a", TTL, TTL);
        (store, registry)
    }

    /// Acknowledge every frame as soon as it arrives and collect them.
    fn drain(mut rx: mpsc::Receiver<OutboundFrame>) -> tokio::task::JoinHandle<Vec<SseFrame>> {
        tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(out) = rx.recv().await {
                frames.push(out.frame);
                let _ = out.flushed.send(());
            }
            frames
        })
    }

    #[tokio::test]
    async fn test_register_writes_session() {
        let (store, registry) = registry();
        let (tx, _rx) = mpsc::channel(8);
        let conn = registry.register("alice", tx).await;

        let session = store.hash_get_all(&keys::session("alice")).await.unwrap();
        assert_eq!(session["serverId"], "node-a");
        assert_eq!(session["connectionId"], conn.id.to_string());
        assert_eq!(session["lastEventId"], "");
        assert!(registry.has("alice"));
        assert_eq!(registry.size(), 1);
    }

    #[tokio::test]
    async fn test_write_without_connection() {
        let (_store, registry) = registry();
        let written = registry
            .write_to_client("nobody", EventName::Message, json!({}), None, WriteOptions::default())
            .await;
        assert!(!written);
    }

    #[tokio::test]
    async fn test_write_advances_last_event_id() {
        let (store, registry) = registry();
        let (tx, rx) = mpsc::channel(8);
        registry.register("alice", tx).await;
        let frames = drain(rx);

        assert!(
            registry
                .write_to_client(
                    "alice",
                    EventName::Message,
                    json!({"id": 5, "message": "hi"}),
                    Some("5"),
                    WriteOptions::default(),
                )
                .await
        );

        let session = store.hash_get_all(&keys::session("alice")).await.unwrap();
        assert_eq!(session["lastEventId"], "5");
        assert_eq!(
            store.get(&keys::resume_cursor("alice")).await.unwrap(),
            Some("5".to_string())
        );

        registry.unregister("alice").await;
        let frames = frames.await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_last_event_id_waits_for_flush() {
        let (store, registry) = registry();
        let registry = Arc::new(registry);
        let (tx, mut rx) = mpsc::channel(1);
        registry.register("alice", tx).await;

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .write_to_client(
                        "alice",
                        EventName::Message,
                        json!({"id": 1}),
                        Some("1"),
                        WriteOptions::default(),
                    )
                    .await
            })
        };

        let out = rx.recv().await.unwrap();
        let session = store.hash_get_all(&keys::session("alice")).await.unwrap();
        assert_eq!(session["lastEventId"], "");

        out.flushed.send(()).unwrap();
        assert!(writer.await.unwrap());
        let session = store.hash_get_all(&keys::session("alice")).await.unwrap();
        assert_eq!(session["lastEventId"], "1");
    }

    #[tokio::test]
    async fn test_replayed_flag() {
        let (_store, registry) = registry();
        let (tx, rx) = mpsc::channel(8);
        registry.register("alice", tx).await;
        let frames = drain(rx);

        registry
            .write_to_client(
                "alice",
                EventName::Message,
                json!({"id": 1}),
                Some("1-0"),
                WriteOptions::replayed(),
            )
            .await;
        registry.unregister("alice").await;

        let frames = frames.await.unwrap();
        let data: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(data["replayed"], true);
    }

    #[tokio::test]
    async fn test_duplicate_message_skipped() {
        let (_store, registry) = registry();
        let (tx, rx) = mpsc::channel(8);
        let conn = registry.register("alice", tx).await;
        conn.mark_live();
        let frames = drain(rx);

        for _ in 0..2 {
            assert!(
                registry
                    .write_to_client(
                        "alice",
                        EventName::Message,
                        json!({"id": 9}),
                        Some("9"),
                        WriteOptions::live(),
                    )
                    .await
            );
        }
        registry.unregister("alice").await;
        drop(conn);
        assert_eq!(frames.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_live_write_waits_for_mark_live() {
        let (_store, registry) = registry();
        let registry = Arc::new(registry);
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("alice", tx).await;

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .write_to_client("alice", EventName::Message, json!({"id": 2}), Some("2"), WriteOptions::live())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        registry.mark_live("alice");
        let out = rx.recv().await.unwrap();
        out.flushed.send(()).unwrap();
        assert!(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_sink_is_evicted() {
        let (store, registry) = registry();
        let (tx, rx) = mpsc::channel(8);
        registry.register("alice", tx).await;
        drop(rx);

        let written = registry
            .write_to_client("alice", EventName::Heartbeat, json!({}), None, WriteOptions::default())
            .await;
        assert!(!written);
        assert!(!registry.has("alice"));
        assert!(store.hash_get_all(&keys::session("alice")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_new_session() {
        let (store, registry) = registry();
        let (tx1, _rx1) = mpsc::channel(8);
        let first = registry.register("alice", tx1).await;
        let (tx2, _rx2) = mpsc::channel(8);
        let second = registry.register("alice", tx2).await;

        assert!(first.is_closed());
        assert!(first.was_replaced());
        assert!(!registry.unregister_connection("alice", first.id).await);

        let session = store.hash_get_all(&keys::session("alice")).await.unwrap();
        assert_eq!(session["connectionId"], second.id.to_string());
        assert!(registry.has("alice"));
    }

    #[tokio::test]
    async fn test_unregister_keeps_session_claimed_elsewhere() {
        let (store, registry) = registry();
        let (tx, _rx) = mpsc::channel(8);
        registry.register("alice", tx).await;

        // Another process took over the session
        store
            .hash_set(
                &keys::session("alice"),
                &[("serverId", "node-b".to_string()), ("connectionId", "other".to_string())],
                TTL,
            )
            .await
            .unwrap();

        registry.unregister("alice").await;
        let session = store.hash_get_all(&keys::session("alice")).await.unwrap();
        assert_eq!(session["serverId"], "node-b");
    }

    #[tokio::test]
    async fn test_retire_local_keeps_session() {
        let (store, registry) = registry();
        let (tx, _rx) = mpsc::channel(8);
        let conn = registry.register("alice", tx).await;

        let retired = registry.retire_local("alice", conn.id).unwrap();
        assert!(retired.is_closed());
        assert!(retired.was_replaced());
        assert!(!registry.has("alice"));
        assert!(!store.hash_get_all(&keys::session("alice")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_survives_store_outage() {
        let (store, registry) = registry();
        store.set_available(false);
        let (tx, _rx) = mpsc::channel(8);
        registry.register("alice", tx).await;
        assert!(registry.has("alice"));
        assert_eq!(registry.all_user_ids(), vec!["alice".to_string()]);
    }
}
