//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    AUTH_TOTAL, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_OPENED_TOTAL,
    CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_REPLACED_TOTAL, CONNECTION_DURATION,
    FRAMES_WRITTEN_TOTAL, HEARTBEATS_SENT_TOTAL, INBOX_FLUSHED_TOTAL,
    MESSAGES_DUPLICATE_SKIPPED_TOTAL, MESSAGES_REPLAYED_TOTAL, PROCESS_MEMORY_BYTES,
    PUBSUB_DROPPED_TOTAL, PUBSUB_RECEIVED_TOTAL, RATELIMIT_ALLOWED_TOTAL, RATELIMIT_DENIED_TOTAL,
    SENDS_TOTAL, STORE_ERRORS_TOTAL, WRITE_FLUSH_LATENCY,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        CONNECTIONS_OPENED_TOTAL.inc();
    }

    pub fn record_closed(lifetime: Duration) {
        CONNECTIONS_CLOSED_TOTAL.inc();
        CONNECTION_DURATION.observe(lifetime.as_secs_f64());
    }

    /// `reason` is one of `unauthorized`, `draining`, `capacity`
    pub fn record_rejected(reason: &str) {
        CONNECTIONS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn record_replaced() {
        CONNECTIONS_REPLACED_TOTAL.inc();
    }

    pub fn set_active(count: usize) {
        CONNECTIONS_ACTIVE.set(count as i64);
    }

    pub fn record_auth(success: bool) {
        let outcome = if success { "success" } else { "failure" };
        AUTH_TOTAL.with_label_values(&[outcome]).inc();
    }
}

pub struct MessageMetrics;

impl MessageMetrics {
    /// `outcome` is one of `delivered`, `queued`, `rate_limited`, `failed`
    pub fn record_send(outcome: &str) {
        SENDS_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn record_frame(event: &str, flush_latency: Duration) {
        FRAMES_WRITTEN_TOTAL.with_label_values(&[event]).inc();
        WRITE_FLUSH_LATENCY.observe(flush_latency.as_secs_f64());
        if event == "heartbeat" {
            HEARTBEATS_SENT_TOTAL.inc();
        }
    }

    pub fn record_replayed(count: u64) {
        MESSAGES_REPLAYED_TOTAL.inc_by(count);
    }

    pub fn record_duplicate_skipped() {
        MESSAGES_DUPLICATE_SKIPPED_TOTAL.inc();
    }

    pub fn record_inbox_flushed(count: u64) {
        INBOX_FLUSHED_TOTAL.inc_by(count);
    }

    pub fn record_pubsub_received() {
        PUBSUB_RECEIVED_TOTAL.inc();
    }

    pub fn record_pubsub_dropped() {
        PUBSUB_DROPPED_TOTAL.inc();
    }
}

pub struct RateLimitMetrics;

impl RateLimitMetrics {
    pub fn record_allowed() {
        RATELIMIT_ALLOWED_TOTAL.inc();
    }

    pub fn record_denied() {
        RATELIMIT_DENIED_TOTAL.inc();
    }
}

pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_error(operation: &str) {
        STORE_ERRORS_TOTAL.with_label_values(&[operation]).inc();
    }
}

/// Helper struct for memory metrics
pub struct MemoryMetrics;

impl MemoryMetrics {
    /// Refresh the resident memory gauge and return it in bytes (0 when unknown).
    pub fn update_process_memory() -> i64 {
        let bytes = Self::read_rss_bytes().unwrap_or(0);
        PROCESS_MEMORY_BYTES.set(bytes);
        bytes
    }

    #[cfg(target_os = "linux")]
    fn read_rss_bytes() -> Option<i64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
        let kb = line.split_whitespace().nth(1)?.parse::<i64>().ok()?;
        Some(kb * 1024)
    }

    #[cfg(not(target_os = "linux"))]
    fn read_rss_bytes() -> Option<i64> {
        None
    }
}
