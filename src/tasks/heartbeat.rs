use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::broadcast;

use crate::config::SseConfig;
use crate::connection_manager::{Connection, ConnectionRegistry, EventName, WriteOptions};
use crate::metrics::StoreMetrics;
use crate::store::{keys, CoordinationStore, StoreError};

/// Per-connection heartbeats plus this instance's liveness marker.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn CoordinationStore>,
    interval: Duration,
    liveness_ttl: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn CoordinationStore>,
        config: &SseConfig,
    ) -> Self {
        Self {
            registry,
            store,
            interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            liveness_ttl: Duration::from_secs(config.liveness_ttl_seconds),
        }
    }

    /// Start the user's heartbeat. No-op if one is already running or the
    /// user has no local connection.
    pub fn start(&self, user_id: &str) -> bool {
        let Some(conn) = self.registry.connection(user_id) else {
            return false;
        };

        let beat = Beat {
            registry: self.registry.clone(),
            store: self.store.clone(),
            interval: self.interval,
            liveness_ttl: self.liveness_ttl,
        };
        let weak = Arc::downgrade(&conn);
        let started = conn.set_heartbeat(move || tokio::spawn(beat.run(weak)));
        if started {
            tracing::debug!(user_id = %user_id, interval_ms = self.interval.as_millis() as u64, "Heartbeat started");
        }
        started
    }

    pub fn stop(&self, user_id: &str) {
        if let Some(conn) = self.registry.connection(user_id) {
            conn.stop_heartbeat();
            tracing::debug!(user_id = %user_id, "Heartbeat stopped");
        }
    }

    pub async fn register_liveness(&self) -> Result<(), StoreError> {
        renew_liveness(self.store.as_ref(), self.registry.server_id(), self.liveness_ttl).await
    }

    pub async fn clear_liveness(&self) -> Result<bool, StoreError> {
        self.store
            .delete(&keys::liveness(self.registry.server_id()))
            .await
    }

    /// Keep the liveness marker fresh while the instance has no connections
    /// to piggyback on. Runs until shutdown is signalled.
    pub async fn run_liveness(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut timer = tokio::time::interval((self.liveness_ttl / 3).max(Duration::from_secs(1)));
        // Skip immediate first tick
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Liveness task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    if let Err(e) = self.register_liveness().await {
                        StoreMetrics::record_error("liveness");
                        tracing::warn!(error = %e, "Failed to renew liveness marker");
                    }
                }
            }
        }
    }
}

async fn renew_liveness(
    store: &dyn CoordinationStore,
    server_id: &str,
    ttl: Duration,
) -> Result<(), StoreError> {
    store.set_ex(&keys::liveness(server_id), "active", ttl).await
}

struct Beat {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn CoordinationStore>,
    interval: Duration,
    liveness_ttl: Duration,
}

impl Beat {
    async fn run(self, conn: Weak<Connection>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.tick().await;

        let Some(mut closed) = conn.upgrade().map(|c| c.closed_signal()) else {
            return;
        };

        loop {
            tokio::select! {
                _ = closed.wait_for(|c| *c) => break,
                _ = timer.tick() => {}
            }

            let Some(conn) = conn.upgrade() else {
                break;
            };

            let data = json!({
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "serverId": self.registry.server_id(),
            });
            if !self
                .registry
                .write_to_connection(&conn, EventName::Heartbeat, data, None, WriteOptions::default())
                .await
            {
                tracing::debug!(user_id = %conn.user_id, "Heartbeat not delivered, stopping");
                break;
            }

            if let Err(e) =
                renew_liveness(self.store.as_ref(), self.registry.server_id(), self.liveness_ttl).await
            {
                StoreMetrics::record_error("liveness");
                tracing::warn!(user_id = %conn.user_id, error = %e, "Failed to renew liveness marker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::OutboundFrame;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    fn setup(heartbeat_ms: u64) -> (Arc<MemoryStore>, Arc<ConnectionRegistry>, HeartbeatMonitor) {
        let store = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(60);
        let registry = Arc::new(ConnectionRegistry::new(store.clone(), "node-a", ttl, ttl));
        let config = SseConfig {
            heartbeat_interval_ms: heartbeat_ms,
            ..SseConfig::default()
        };
        let monitor = HeartbeatMonitor::new(registry.clone(), store.clone(), &config);
        (store, registry, monitor)
    }

    async fn next(rx: &mut mpsc::Receiver<OutboundFrame>) -> Option<OutboundFrame> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_heartbeat_frames_and_liveness() {
        let (store, registry, monitor) = setup(10);
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("alice", tx).await;

        assert!(monitor.start("alice"));
        assert!(!monitor.start("alice"));

        let out = next(&mut rx).await.unwrap();
        assert_eq!(out.frame.event, EventName::Heartbeat);
        assert_eq!(out.frame.id, None);
        let data: serde_json::Value = serde_json::from_str(&out.frame.data).unwrap();
        assert_eq!(data["serverId"], "node-a");
        let timestamp = data["timestamp"].as_str().unwrap();
        assert!(timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
        out.flushed.send(()).unwrap();

        // The liveness marker is renewed after the write is acknowledged
        let _ = next(&mut rx).await.map(|o| o.flushed.send(()));
        assert_eq!(
            store.get(&keys::liveness("node-a")).await.unwrap(),
            Some("active".to_string())
        );
        monitor.stop("alice");
    }

    #[tokio::test]
    async fn test_heartbeat_ends_when_connection_closes() {
        let (_store, registry, monitor) = setup(10);
        let (tx, rx) = mpsc::channel(8);
        let conn = registry.register("alice", tx).await;
        monitor.start("alice");

        drop(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.has_heartbeat());
        assert!(!registry.has("alice"));
    }

    #[tokio::test]
    async fn test_start_without_connection() {
        let (_store, _registry, monitor) = setup(10);
        assert!(!monitor.start("ghost"));
    }

    #[tokio::test]
    async fn test_liveness_failure_keeps_connection() {
        let (store, registry, monitor) = setup(10);
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("alice", tx).await;
        store.set_available(false);
        monitor.start("alice");

        for _ in 0..2 {
            let out = next(&mut rx).await.unwrap();
            out.flushed.send(()).unwrap();
        }
        assert!(registry.has("alice"));
        monitor.stop("alice");
    }

    #[tokio::test]
    async fn test_register_and_clear_liveness() {
        let (store, _registry, monitor) = setup(10);
        monitor.register_liveness().await.unwrap();
        assert!(store.ttl(&keys::liveness("node-a")).unwrap() <= Duration::from_secs(60));
        assert!(monitor.clear_liveness().await.unwrap());
        assert_eq!(store.get(&keys::liveness("node-a")).await.unwrap(), None);
    }
}
