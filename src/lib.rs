// Shared infrastructure
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;
pub mod store;

// Delivery domain
pub mod connection_manager;
pub mod delivery;
pub mod event;
pub mod event_log;
pub mod inbox;
pub mod pubsub;
pub mod ratelimit;

// Application layer
pub mod api;
pub mod server;
pub mod sse;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
