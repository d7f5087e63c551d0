use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;
use crate::sse::sse_handler;

use super::health::health;
use super::metrics::prometheus_metrics;
use super::send::send_message;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Streaming
        .route("/events", get(sse_handler))
        // Messaging
        .route("/send", post(send_message))
        // Health & metrics
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
}
