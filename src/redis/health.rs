use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RedisHealthStatus {
    Connected = 0,
    Reconnecting = 1,
    CircuitOpen = 2,
}

impl RedisHealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RedisHealthStatus::Connected,
            2 => RedisHealthStatus::CircuitOpen,
            _ => RedisHealthStatus::Reconnecting,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedisHealthStatus::Connected => "connected",
            RedisHealthStatus::Reconnecting => "reconnecting",
            RedisHealthStatus::CircuitOpen => "circuit_open",
        }
    }
}

/// Connection state shared by the command pool and the subscriber task.
pub struct RedisHealth {
    status: AtomicU8,
    seen_connected: AtomicBool,
    reconnections: AtomicU32,
}

impl RedisHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(RedisHealthStatus::Reconnecting as u8),
            seen_connected: AtomicBool::new(false),
            reconnections: AtomicU32::new(0),
        }
    }

    pub fn set_connected(&self) {
        let previous = self.swap(RedisHealthStatus::Connected);
        let seen_before = self.seen_connected.swap(true, Ordering::AcqRel);
        if seen_before && previous != RedisHealthStatus::Connected {
            self.reconnections.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn set_reconnecting(&self) {
        if self.swap(RedisHealthStatus::Reconnecting) == RedisHealthStatus::Connected {
            tracing::warn!("Redis connection lost");
        }
    }

    pub fn set_circuit_open(&self) {
        self.swap(RedisHealthStatus::CircuitOpen);
    }

    pub fn status(&self) -> RedisHealthStatus {
        RedisHealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Times the connection came back after having been up once.
    pub fn reconnections(&self) -> u32 {
        self.reconnections.load(Ordering::Acquire)
    }

    fn swap(&self, status: RedisHealthStatus) -> RedisHealthStatus {
        RedisHealthStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel))
    }
}

impl Default for RedisHealth {
    fn default() -> Self {
        Self::new()
    }
}
