use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id as issued by the login service; numeric ids are accepted
    #[serde(
        rename = "userId",
        default,
        deserialize_with = "id_claim",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    /// Standard subject, used when `userId` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

fn id_claim<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(id) => Some(id),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    })
}

impl Claims {
    pub fn user_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_prefers_user_id_claim() {
        let claims: Claims =
            serde_json::from_str(r#"{"userId":"42","sub":"other","username":"alice"}"#).unwrap();
        assert_eq!(claims.user_id(), Some("42"));
        assert_eq!(claims.extra["username"], "alice");
    }

    #[test]
    fn test_numeric_user_id() {
        let claims: Claims = serde_json::from_str(r#"{"userId":7,"iat":1}"#).unwrap();
        assert_eq!(claims.user_id(), Some("7"));
    }

    #[test]
    fn test_user_id_falls_back_to_sub() {
        let claims: Claims = serde_json::from_str(r#"{"sub":"user-7"}"#).unwrap();
        assert_eq!(claims.user_id(), Some("user-7"));

        let claims: Claims = serde_json::from_str(r#"{"userId":null,"sub":"user-8"}"#).unwrap();
        assert_eq!(claims.user_id(), Some("user-8"));
    }

    #[test]
    fn test_missing_identity() {
        let claims: Claims = serde_json::from_str(r#"{"userId":""}"#).unwrap();
        assert_eq!(claims.user_id(), None);
    }
}
