//! Server-sent event frames.
//!
//! On the wire a frame is
//!
//! ```text
//! event: <name>
//! data: <json>
//! id: <event id>
//!
//! ```
//!
//! with the `id:` line omitted when no id applies.

use axum::response::sse::Event;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Connected,
    Message,
    Heartbeat,
    Reconnect,
    QueuedFlush,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Connected => "connected",
            EventName::Message => "message",
            EventName::Heartbeat => "heartbeat",
            EventName::Reconnect => "reconnect",
            EventName::QueuedFlush => "queued_flush",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "connected" => Some(EventName::Connected),
            "message" => Some(EventName::Message),
            "heartbeat" => Some(EventName::Heartbeat),
            "reconnect" => Some(EventName::Reconnect),
            "queued_flush" => Some(EventName::QueuedFlush),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: EventName,
    /// Single-line JSON
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    pub fn new(event: EventName, data: &Value, id: Option<&str>) -> Self {
        Self {
            event,
            data: data.to_string(),
            // Line breaks would split the frame
            id: id
                .filter(|id| !id.is_empty() && !id.contains(['\n', '\r']))
                .map(str::to_string),
        }
    }

    /// Text form of the frame as sent to the client.
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\ndata: {}\n", self.event.as_str(), self.data);
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    pub fn into_event(self) -> Event {
        let event = Event::default().event(self.event.as_str()).data(self.data);
        match self.id {
            Some(id) => event.id(id),
            None => event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_with_id() {
        let frame = SseFrame::new(EventName::Message, &json!({"id": 1}), Some("1"));
        assert_eq!(frame.encode(), "event: message\ndata: {\"id\":1}\nid: 1\n\n");
    }

    #[test]
    fn test_frame_without_id() {
        let frame = SseFrame::new(EventName::Heartbeat, &json!({"timestamp": 5}), None);
        assert_eq!(frame.encode(), "event: heartbeat\ndata: {\"timestamp\":5}\n\n");
    }

    #[test]
    fn test_unsafe_id_dropped() {
        let frame = SseFrame::new(EventName::Message, &json!({}), Some("1\nevent: x"));
        assert_eq!(frame.id, None);
    }

    #[test]
    fn test_event_names_round_trip() {
        for name in [
            EventName::Connected,
            EventName::Message,
            EventName::Heartbeat,
            EventName::Reconnect,
            EventName::QueuedFlush,
        ] {
            assert_eq!(EventName::parse(name.as_str()), Some(name));
        }
        assert_eq!(EventName::parse("error"), None);
    }
}
