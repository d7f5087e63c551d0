//! Credential extraction for incoming requests.

use axum::http::{header, HeaderMap};
use serde::Deserialize;

/// Query parameters that may carry a credential or resume cursor.
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
    #[serde(rename = "lastEventId")]
    pub last_event_id: Option<String>,
}

/// Bearer token from the `Authorization` header only.
fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Token lookup order: `Authorization: Bearer`, then `?token=`, then the `token` cookie.
pub fn extract_token(query: &TokenQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer(headers) {
        return Some(token);
    }

    if let Some(token) = query.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    cookie_token(headers)
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == "token" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
