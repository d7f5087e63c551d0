//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::metrics::MemoryMetrics;
use crate::server::AppState;
use crate::store::ConnectionInfo;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub server_id: String,
    pub connected_users: usize,
    pub max_connections: usize,
    /// `ok` when the coordination store answers a ping
    pub redis_status: &'static str,
    pub store_backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<ConnectionInfo>,
    /// Seconds since startup
    pub uptime: u64,
    pub shutting_down: bool,
    pub drain_state: &'static str,
    #[serde(rename = "memoryMB")]
    pub memory_mb: i64,
}

/// GET /health. Always 200; `status` is `degraded` when the store is
/// unreachable or the instance is draining.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis_status = match state.store.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Health check ping failed");
            "error"
        }
    };
    let shutting_down = state.drain.is_draining();
    let status = if redis_status == "ok" && !shutting_down {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        server_id: state.registry.server_id().to_string(),
        connected_users: state.registry.size(),
        max_connections: state.settings.server.max_connections,
        redis_status,
        store_backend: state.store.backend().as_str(),
        redis: state.store.connection_info(),
        uptime: state.started_at.elapsed().as_secs(),
        shutting_down,
        drain_state: state.drain.state().as_str(),
        memory_mb: MemoryMetrics::update_process_memory() / 1024 / 1024,
    })
}
