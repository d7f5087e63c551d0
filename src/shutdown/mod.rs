//! Draining an instance before it stops.
//!
//! The drain sequence:
//! 1. Stop accepting connections (health reports degraded)
//! 2. Ask every connected client to reconnect elsewhere
//! 3. Give clients the grace period to leave
//! 4. Release sessions still owned by this instance and close what is left
//! 5. Remove the liveness marker and signal background tasks to stop

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::DrainConfig;
use crate::connection_manager::{ConnectionRegistry, EventName, WriteOptions};
use crate::metrics::StoreMetrics;
use crate::pubsub::PubSubRouter;
use crate::store::{keys, CoordinationStore};
use crate::tasks::HeartbeatMonitor;

/// Timeout for each reconnect notification
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrainState {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl DrainState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DrainState::Running,
            1 => DrainState::Draining,
            _ => DrainState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DrainState::Running => "running",
            DrainState::Draining => "draining",
            DrainState::Stopped => "stopped",
        }
    }
}

pub struct DrainController {
    state: AtomicU8,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn CoordinationStore>,
    heartbeat: Arc<HeartbeatMonitor>,
    pubsub: Arc<PubSubRouter>,
    shutdown_tx: broadcast::Sender<()>,
    config: DrainConfig,
}

impl DrainController {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn CoordinationStore>,
        heartbeat: Arc<HeartbeatMonitor>,
        pubsub: Arc<PubSubRouter>,
        shutdown_tx: broadcast::Sender<()>,
        config: DrainConfig,
    ) -> Self {
        Self {
            state: AtomicU8::new(DrainState::Running as u8),
            registry,
            store,
            heartbeat,
            pubsub,
            shutdown_tx,
            config,
        }
    }

    pub fn state(&self) -> DrainState {
        DrainState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once draining has started, including after it finished.
    pub fn is_draining(&self) -> bool {
        self.state() != DrainState::Running
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.config.hard_timeout_ms)
    }

    /// Run the drain sequence. Only the first call does any work.
    #[tracing::instrument(
        name = "drain",
        skip(self),
        fields(
            server_id = %self.registry.server_id(),
            total_connections = self.registry.size()
        )
    )]
    pub async fn drain(&self) -> DrainReport {
        let start = std::time::Instant::now();
        let mut report = DrainReport::default();

        if self
            .state
            .compare_exchange(
                DrainState::Running as u8,
                DrainState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!("Drain already in progress");
            return report;
        }
        report.started = true;

        tracing::info!("Draining - Phase 1: Asking clients to reconnect");
        report.clients_notified = self.notify_clients().await;

        tracing::info!(
            grace_period_ms = self.config.grace_period_ms,
            "Draining - Phase 2: Waiting for clients to leave"
        );
        self.wait_for_clients().await;

        tracing::info!("Draining - Phase 3: Releasing sessions");
        let (released, closed) = self.release_remaining().await;
        report.sessions_released = released;
        report.connections_closed = closed;

        tracing::info!("Draining - Phase 4: Stopping background tasks");
        if let Err(e) = self.heartbeat.clear_liveness().await {
            StoreMetrics::record_error("liveness");
            tracing::warn!(error = %e, "Failed to remove liveness marker");
        }
        self.pubsub.shutdown().await;
        let _ = self.shutdown_tx.send(());

        self.state
            .store(DrainState::Stopped as u8, Ordering::Release);
        report.duration = start.elapsed();

        tracing::info!(
            clients_notified = report.clients_notified,
            sessions_released = report.sessions_released,
            connections_closed = report.connections_closed,
            duration_ms = report.duration.as_millis() as u64,
            "Drain completed"
        );

        report
    }

    async fn notify_clients(&self) -> usize {
        let users = self.registry.all_user_ids();
        if users.is_empty() {
            return 0;
        }

        let data = json!({
            "reason": "server_drain",
            "retryAfter": self.config.reconnect_after_seconds,
        });

        let mut futures: FuturesUnordered<_> = users
            .into_iter()
            .map(|user_id| {
                let data = data.clone();
                async move {
                    let write = self.registry.write_to_client(
                        &user_id,
                        EventName::Reconnect,
                        data,
                        None,
                        WriteOptions::default(),
                    );
                    match timeout(NOTIFY_TIMEOUT, write).await {
                        Ok(written) => written,
                        Err(_) => {
                            tracing::debug!(user_id = %user_id, "Timeout sending reconnect notice");
                            false
                        }
                    }
                }
            })
            .collect();

        let mut notified = 0;
        while let Some(written) = futures.next().await {
            if written {
                notified += 1;
            }
        }
        notified
    }

    async fn wait_for_clients(&self) {
        let grace = Duration::from_millis(self.config.grace_period_ms);
        let wait = async {
            while self.registry.size() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        if timeout(grace, wait).await.is_err() {
            tracing::info!(
                remaining_connections = self.registry.size(),
                "Grace period elapsed"
            );
        }
    }

    async fn release_remaining(&self) -> (usize, usize) {
        let server_id = self.registry.server_id().to_string();
        let mut released = 0;
        let mut closed = 0;

        for user_id in self.registry.all_user_ids() {
            match self
                .store
                .delete_if_field_equals(&keys::session(&user_id), "serverId", &server_id)
                .await
            {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    StoreMetrics::record_error("session_delete");
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to release session");
                }
            }
            self.heartbeat.stop(&user_id);
            self.pubsub.unsubscribe(&user_id).await;
            self.registry.unregister(&user_id).await;
            closed += 1;
        }

        (released, closed)
    }
}

/// Outcome of a drain
#[derive(Debug, Default)]
pub struct DrainReport {
    /// False when another drain was already running
    pub started: bool,
    pub clients_notified: usize,
    /// Sessions force-deleted after the grace period
    pub sessions_released: usize,
    /// Connections still open after the grace period
    pub connections_closed: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SseConfig;
    use crate::connection_manager::OutboundFrame;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        pubsub: Arc<PubSubRouter>,
        drain: DrainController,
        shutdown_rx: broadcast::Receiver<()>,
    }

    async fn fixture(grace_period_ms: u64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn CoordinationStore> = store.clone();
        let ttl = Duration::from_secs(60);
        let registry = Arc::new(ConnectionRegistry::new(shared.clone(), "node-a", ttl, ttl));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            shared.clone(),
            &SseConfig::default(),
        ));
        let pubsub = Arc::new(PubSubRouter::start(shared.clone(), registry.clone()).await.unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let drain = DrainController::new(
            registry.clone(),
            shared,
            heartbeat,
            pubsub.clone(),
            shutdown_tx,
            DrainConfig {
                grace_period_ms,
                ..DrainConfig::default()
            },
        );
        Fixture {
            store,
            registry,
            pubsub,
            drain,
            shutdown_rx,
        }
    }

    fn collect(mut rx: mpsc::Receiver<OutboundFrame>) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(out) = rx.recv().await {
                frames.push(out.frame.encode());
                let _ = out.flushed.send(());
            }
            frames
        })
    }

    #[tokio::test]
    async fn test_drain_without_connections() {
        let mut f = fixture(50).await;
        assert_eq!(f.drain.state(), DrainState::Running);

        let report = f.drain.drain().await;
        assert!(report.started);
        assert_eq!(report.clients_notified, 0);
        assert_eq!(f.drain.state(), DrainState::Stopped);
        assert!(f.drain.is_draining());
        assert!(f.shutdown_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_drain_notifies_and_releases() {
        let f = fixture(50).await;
        for user in ["alice", "bob"] {
            let (tx, rx) = mpsc::channel(8);
            f.registry.register(user, tx).await;
            f.pubsub.subscribe(user).await.unwrap();
            collect(rx);
        }
        f.store
            .set_ex(&keys::liveness("node-a"), "active", Duration::from_secs(60))
            .await
            .unwrap();

        let report = f.drain.drain().await;
        assert_eq!(report.clients_notified, 2);
        assert_eq!(report.sessions_released, 2);
        assert_eq!(report.connections_closed, 2);

        assert_eq!(f.registry.size(), 0);
        assert!(!f.pubsub.is_subscribed("alice"));
        for user in ["alice", "bob"] {
            assert!(f.store.hash_get_all(&keys::session(user)).await.unwrap().is_empty());
        }
        assert_eq!(f.store.get(&keys::liveness("node-a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reconnect_notice_format() {
        let f = fixture(10).await;
        let (tx, rx) = mpsc::channel(8);
        f.registry.register("alice", tx).await;
        let frames = collect(rx);

        f.drain.drain().await;
        let frames = frames.await.unwrap();
        assert_eq!(
            frames[0],
            "event: reconnect\ndata: {\"reason\":\"server_drain\",\"retryAfter\":2}\n\n"
        );
    }

    #[tokio::test]
    async fn test_session_owned_elsewhere_is_kept() {
        let f = fixture(10).await;
        let (tx, rx) = mpsc::channel(8);
        f.registry.register("alice", tx).await;
        collect(rx);

        // The user already reconnected to another instance
        f.store
            .hash_set(
                &keys::session("alice"),
                &[("serverId", "node-b".to_string()), ("connectionId", "x".to_string())],
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let report = f.drain.drain().await;
        assert_eq!(report.sessions_released, 0);
        let session = f.store.hash_get_all(&keys::session("alice")).await.unwrap();
        assert_eq!(session["serverId"], "node-b");
    }

    #[tokio::test]
    async fn test_second_drain_is_noop() {
        let f = fixture(10).await;
        assert!(f.drain.drain().await.started);
        assert!(!f.drain.drain().await.started);
    }
}
