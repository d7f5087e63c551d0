//! Key and channel names in the shared store.

/// System-wide event id counter.
pub const EVENT_COUNTER: &str = "event:id:counter";

pub fn session(user_id: &str) -> String {
    format!("user:{}:session", user_id)
}

pub fn resume_cursor(user_id: &str) -> String {
    format!("user:{}:cursor", user_id)
}

pub fn event_stream(user_id: &str) -> String {
    format!("stream:{}", user_id)
}

pub fn inbox(user_id: &str) -> String {
    format!("inbox:{}", user_id)
}

pub fn rate_window(user_id: &str, window: u64) -> String {
    format!("ratelimit:{}:{}", user_id, window)
}

pub fn liveness(server_id: &str) -> String {
    format!("server:{}:status", server_id)
}

/// Pub/sub channel carrying live messages for one user.
pub fn user_channel(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Inverse of [`user_channel`].
pub fn user_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix("user:").filter(|id| !id.is_empty())
}
