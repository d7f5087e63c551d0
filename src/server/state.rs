use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::auth::{Authenticator, JwtValidator};
use crate::config::Settings;
use crate::connection_manager::ConnectionRegistry;
use crate::delivery::DeliveryOrchestrator;
use crate::event_log::EventLog;
use crate::inbox::OfflineInbox;
use crate::pubsub::PubSubRouter;
use crate::ratelimit::RateLimiter;
use crate::shutdown::DrainController;
use crate::store::{CoordinationStore, StoreError};
use crate::tasks::HeartbeatMonitor;

/// Everything one relay instance owns, shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn CoordinationStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub registry: Arc<ConnectionRegistry>,
    pub event_log: Arc<EventLog>,
    pub inbox: Arc<OfflineInbox>,
    pub pubsub: Arc<PubSubRouter>,
    pub rate_limiter: Arc<RateLimiter>,
    pub delivery: Arc<DeliveryOrchestrator>,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub drain: Arc<DrainController>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire up an instance on top of `store`. Several instances may share
    /// one store.
    pub async fn new(settings: Settings, store: Arc<dyn CoordinationStore>) -> Result<Self, StoreError> {
        let authenticator: Arc<dyn Authenticator> = Arc::new(JwtValidator::new(&settings.jwt));
        Self::with_authenticator(settings, store, authenticator).await
    }

    pub async fn with_authenticator(
        settings: Settings,
        store: Arc<dyn CoordinationStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, StoreError> {
        let registry = Arc::new(ConnectionRegistry::new(
            store.clone(),
            settings.server.server_id.clone(),
            Duration::from_secs(settings.sse.session_ttl_seconds),
            Duration::from_secs(settings.stream.ttl_seconds),
        ));
        let event_log = Arc::new(EventLog::new(store.clone(), registry.clone(), &settings.stream));
        let inbox = Arc::new(OfflineInbox::new(store.clone(), &settings.inbox));
        let pubsub = Arc::new(PubSubRouter::start(store.clone(), registry.clone()).await?);
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), &settings.rate_limit));
        let delivery = Arc::new(DeliveryOrchestrator::new(
            store.clone(),
            rate_limiter.clone(),
            event_log.clone(),
            inbox.clone(),
            pubsub.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            store.clone(),
            &settings.sse,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let drain = Arc::new(DrainController::new(
            registry.clone(),
            store.clone(),
            heartbeat.clone(),
            pubsub.clone(),
            shutdown_tx.clone(),
            settings.drain.clone(),
        ));

        Ok(Self {
            settings: Arc::new(settings),
            store,
            authenticator,
            registry,
            event_log,
            inbox,
            pubsub,
            rate_limiter,
            delivery,
            heartbeat,
            drain,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    pub fn server_id(&self) -> &str {
        self.registry.server_id()
    }
}
