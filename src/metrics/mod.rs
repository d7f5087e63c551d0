//! Prometheus metrics for the relay.
//!
//! - Connection metrics (active streams, opens, closes, rejections)
//! - Message metrics (send outcomes, frames written, replay, inbox flush)
//! - Pub/sub, heartbeat and rate limiting counters
//! - Store error counters by operation

mod helpers;

pub use helpers::{
    encode_metrics, ConnectionMetrics, MemoryMetrics, MessageMetrics, RateLimitMetrics,
    StoreMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "sse_relay";

lazy_static! {
    // Connections

    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of open event streams on this instance"
    ).unwrap();

    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total event streams opened"
    ).unwrap();

    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total event streams closed"
    ).unwrap();

    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_rejected_total", METRIC_PREFIX),
        "Event stream requests rejected before registration",
        &["reason"]
    ).unwrap();

    pub static ref CONNECTIONS_REPLACED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_replaced_total", METRIC_PREFIX),
        "Connections retired because the same user connected again"
    ).unwrap();

    pub static ref CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_connection_duration_seconds", METRIC_PREFIX),
        "Lifetime of event streams in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0, 86400.0]
    ).unwrap();

    // Messages

    pub static ref SENDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_sends_total", METRIC_PREFIX),
        "Send requests by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref FRAMES_WRITTEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_frames_written_total", METRIC_PREFIX),
        "Frames flushed to clients by event name",
        &["event"]
    ).unwrap();

    pub static ref MESSAGES_REPLAYED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_replayed_total", METRIC_PREFIX),
        "Event log entries replayed on reconnect"
    ).unwrap();

    pub static ref MESSAGES_DUPLICATE_SKIPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_duplicate_skipped_total", METRIC_PREFIX),
        "Messages not written because the connection already received them"
    ).unwrap();

    pub static ref INBOX_FLUSHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_inbox_flushed_total", METRIC_PREFIX),
        "Queued messages delivered from offline inboxes"
    ).unwrap();

    pub static ref WRITE_FLUSH_LATENCY: Histogram = register_histogram!(
        format!("{}_write_flush_latency_seconds", METRIC_PREFIX),
        "Time from write to flush acknowledgement",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // Pub/sub and heartbeat

    pub static ref PUBSUB_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pubsub_received_total", METRIC_PREFIX),
        "Messages received from the broker"
    ).unwrap();

    pub static ref PUBSUB_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pubsub_dropped_total", METRIC_PREFIX),
        "Broker messages dropped because the user has no local connection"
    ).unwrap();

    pub static ref HEARTBEATS_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_heartbeats_sent_total", METRIC_PREFIX),
        "Heartbeat frames flushed to clients"
    ).unwrap();

    // Auth and rate limiting

    pub static ref AUTH_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_auth_total", METRIC_PREFIX),
        "Authentication attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref RATELIMIT_ALLOWED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ratelimit_allowed_total", METRIC_PREFIX),
        "Sends allowed by the rate limiter"
    ).unwrap();

    pub static ref RATELIMIT_DENIED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ratelimit_denied_total", METRIC_PREFIX),
        "Sends denied by the rate limiter"
    ).unwrap();

    // Store and process

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Coordination store failures by operation",
        &["operation"]
    ).unwrap();

    pub static ref PROCESS_MEMORY_BYTES: IntGauge = register_int_gauge!(
        format!("{}_process_memory_bytes", METRIC_PREFIX),
        "Resident memory of the process in bytes"
    ).unwrap();
}
