use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use uuid::Uuid;

/// Flat environment variables understood by earlier deployments, mapped onto
/// the nested configuration keys. They win over every other source.
const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SERVER_ID", "server.server_id"),
    ("PORT", "server.port"),
    ("MAX_CONNECTIONS_PER_SERVER", "server.max_connections"),
    ("REDIS_URL", "redis.url"),
    ("JWT_SECRET", "jwt.secret"),
    ("HEARTBEAT_INTERVAL", "sse.heartbeat_interval_ms"),
    ("INBOX_TTL_SECONDS", "inbox.ttl_seconds"),
    ("EVENT_STREAM_MAXLEN", "stream.max_len"),
    ("EVENT_STREAM_TTL", "stream.ttl_seconds"),
    ("RATE_LIMIT_MAX", "rate_limit.max"),
    ("RATE_LIMIT_WINDOW_SECONDS", "rate_limit.window_seconds"),
];

const DEV_JWT_SECRET: &str = "your-super-secret-jwt-key-change-in-production";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sse: SseConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Identifier of this instance in the shared store
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Local connection limit; further connects are rejected with 503
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
    #[serde(default = "default_backoff_initial_delay")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max_delay")]
    pub backoff_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// "redis" (default) or "memory" (single instance / tests)
    #[serde(default = "default_store_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SseConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
    #[serde(default = "default_liveness_ttl")]
    pub liveness_ttl_seconds: u64,
    /// Frames buffered per connection before writers are suspended
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    /// Resume from the stored cursor when a client reconnects without one
    #[serde(default = "default_true")]
    pub resume_without_cursor: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_max_len")]
    pub max_len: usize,
    #[serde(default = "default_stream_ttl")]
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboxConfig {
    #[serde(default = "default_inbox_ttl")]
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Sends allowed per sender per window
    #[serde(default = "default_rate_limit_max")]
    pub max: u64,
    #[serde(default = "default_rate_limit_window")]
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_hard_timeout_ms")]
    pub hard_timeout_ms: u64,
    /// Delay suggested to clients in the `reconnect` event
    #[serde(default = "default_reconnect_after")]
    pub reconnect_after_seconds: u64,
    /// Retry hint returned when a connection is rejected
    #[serde(default = "default_reject_retry_after")]
    pub reject_retry_after_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otel_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_server_id() -> String {
    format!("relay-{}", Uuid::new_v4().simple())
}

fn default_max_connections() -> usize {
    50_000
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout() -> u64 {
    30
}

fn default_backoff_initial_delay() -> u64 {
    100
}

fn default_backoff_max_delay() -> u64 {
    3_000
}

fn default_store_backend() -> String {
    "redis".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_session_ttl() -> u64 {
    86_400 // 1 day
}

fn default_liveness_ttl() -> u64 {
    60
}

fn default_send_buffer() -> usize {
    32
}

fn default_true() -> bool {
    true
}

fn default_stream_max_len() -> usize {
    500
}

fn default_stream_ttl() -> u64 {
    3_600 // 1 hour
}

fn default_inbox_ttl() -> u64 {
    604_800 // 7 days
}

fn default_rate_limit_max() -> u64 {
    100
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_hard_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_after() -> u64 {
    2
}

fn default_reject_retry_after() -> u64 {
    5
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "sse-relay-service".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("jwt.secret", DEV_JWT_SECRET)?
            .set_default("redis.url", default_redis_url())?
            .set_default("store.backend", default_store_backend())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // RELAY__SERVER__PORT, RELAY__RATE_LIMIT__MAX, ...
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        for (var, key) in LEGACY_ENV_OVERRIDES {
            builder = builder.set_override_option(*key, env::var(var).ok())?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt.secret == DEV_JWT_SECRET
    }

    /// Settings suitable for tests and embedded use: memory store, dev secret.
    pub fn for_memory_store(server_id: &str) -> Self {
        Self {
            server: ServerConfig {
                server_id: server_id.to_string(),
                ..Default::default()
            },
            jwt: JwtConfig {
                secret: DEV_JWT_SECRET.to_string(),
                issuer: None,
                audience: None,
            },
            redis: RedisConfig::default(),
            store: StoreConfig {
                backend: "memory".to_string(),
            },
            sse: SseConfig::default(),
            stream: StreamConfig::default(),
            inbox: InboxConfig::default(),
            rate_limit: RateLimitConfig::default(),
            drain: DrainConfig::default(),
            otel: OtelConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_id: default_server_id(),
            max_connections: default_max_connections(),
            cors_origins: vec![],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
            backoff_initial_delay_ms: default_backoff_initial_delay(),
            backoff_max_delay_ms: default_backoff_max_delay(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
        }
    }
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            session_ttl_seconds: default_session_ttl(),
            liveness_ttl_seconds: default_liveness_ttl(),
            send_buffer: default_send_buffer(),
            resume_without_cursor: true,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_len: default_stream_max_len(),
            ttl_seconds: default_stream_ttl(),
        }
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_inbox_ttl(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: default_rate_limit_max(),
            window_seconds: default_rate_limit_window(),
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            hard_timeout_ms: default_hard_timeout_ms(),
            reconnect_after_seconds: default_reconnect_after(),
            reject_retry_after_seconds: default_reject_retry_after(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_otel_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 3000);
        assert_eq!(server.max_connections, 50_000);
        assert!(server.server_id.starts_with("relay-"));
    }

    #[test]
    fn test_original_deployment_defaults() {
        let sse = SseConfig::default();
        assert_eq!(sse.heartbeat_interval_ms, 30_000);
        assert_eq!(sse.session_ttl_seconds, 86_400);

        let stream = StreamConfig::default();
        assert_eq!(stream.max_len, 500);
        assert_eq!(stream.ttl_seconds, 3_600);

        assert_eq!(InboxConfig::default().ttl_seconds, 604_800);

        let rate = RateLimitConfig::default();
        assert_eq!(rate.max, 100);
        assert_eq!(rate.window_seconds, 60);

        let drain = DrainConfig::default();
        assert_eq!(drain.grace_period_ms, 5_000);
        assert_eq!(drain.hard_timeout_ms, 10_000);
        assert_eq!(drain.reconnect_after_seconds, 2);
    }

    #[test]
    fn test_memory_store_settings() {
        let settings = Settings::for_memory_store("node-a");
        assert_eq!(settings.server.server_id, "node-a");
        assert_eq!(settings.store.backend, "memory");
        assert!(settings.uses_dev_secret());
        assert_eq!(settings.server_addr(), "0.0.0.0:3000");
    }
}
