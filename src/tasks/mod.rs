mod heartbeat;

pub use heartbeat::HeartbeatMonitor;
