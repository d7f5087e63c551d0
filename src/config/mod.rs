mod settings;

pub use settings::{
    DrainConfig, InboxConfig, JwtConfig, OtelConfig, RateLimitConfig, RedisConfig, ServerConfig,
    Settings, SseConfig, StoreConfig, StreamConfig,
};
