//! The message event relayed between users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user-to-user message. Immutable once created; `queued` is set only on
/// the copy that goes into an offline inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEvent {
    pub id: u64,
    pub from_user_id: String,
    pub to_user_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub queued: bool,
}

impl RelayEvent {
    pub fn new(id: u64, from_user_id: &str, to_user_id: &str, message: &str) -> Self {
        Self {
            id,
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            message: message.to_string(),
            at: Utc::now(),
            queued: false,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Global event id carried in a message payload, if any.
pub fn payload_event_id(data: &Value) -> Option<u64> {
    match data.get("id")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let event = RelayEvent::new(7, "alice", "bob", "hi");
        let value = event.to_value();
        assert_eq!(value["id"], 7);
        assert_eq!(value["fromUserId"], "alice");
        assert_eq!(value["toUserId"], "bob");
        assert_eq!(value["message"], "hi");
        assert_eq!(value["queued"], false);
        assert!(value["at"].is_string());
    }

    #[test]
    fn test_payload_event_id() {
        assert_eq!(payload_event_id(&serde_json::json!({"id": 12})), Some(12));
        assert_eq!(payload_event_id(&serde_json::json!({"id": "13"})), Some(13));
        assert_eq!(payload_event_id(&serde_json::json!({"timestamp": 1})), None);
    }
}
