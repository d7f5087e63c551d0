//! Message submission endpoint.

use std::collections::BTreeMap;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use serde_json::Value;

use crate::auth::{extract_token, TokenQuery};
use crate::delivery::{SendError, SendOutcome};
use crate::error::{AppError, Result};
use crate::server::AppState;

pub const MAX_MESSAGE_LENGTH: usize = 2000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    /// `delivered` or `queued`
    pub status: &'static str,
    pub online: bool,
    pub event_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_to: Option<String>,
}

impl From<SendOutcome> for SendResponse {
    fn from(outcome: SendOutcome) -> Self {
        match outcome {
            SendOutcome::Delivered {
                event_id,
                delivered_to,
            } => Self {
                status: "delivered",
                online: true,
                event_id,
                delivered_to: Some(delivered_to),
            },
            SendOutcome::Queued { event_id } => Self {
                status: "queued",
                online: false,
                event_id,
                delivered_to: None,
            },
        }
    }
}

/// A validated send request.
#[derive(Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub to_user_id: String,
    pub message: String,
}

/// Check a raw request body. Every failing field is reported.
pub fn validate(sender: &str, body: &Value) -> std::result::Result<SendRequest, BTreeMap<&'static str, String>> {
    let mut errors = BTreeMap::new();

    let to_user_id = match body.get("toUserId") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    match &to_user_id {
        None => {
            errors.insert("toUserId", "Recipient is required".to_string());
        }
        Some(to) if to == sender => {
            errors.insert("toUserId", "Cannot send message to yourself".to_string());
        }
        Some(_) => {}
    }

    let message = match body.get("message") {
        None | Some(Value::Null) => {
            errors.insert("message", "Message is required".to_string());
            None
        }
        Some(Value::String(s)) if s.is_empty() => {
            errors.insert("message", "Message is required".to_string());
            None
        }
        Some(Value::String(s)) if s.chars().count() > MAX_MESSAGE_LENGTH => {
            errors.insert(
                "message",
                format!("Message must be at most {} characters", MAX_MESSAGE_LENGTH),
            );
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.insert("message", "Message must be a string".to_string());
            None
        }
    };

    match (to_user_id, message) {
        (Some(to_user_id), Some(message)) if errors.is_empty() => Ok(SendRequest {
            to_user_id,
            message,
        }),
        _ => Err(errors),
    }
}

/// POST /send
///
/// Credentials are looked up in the same order as for event streams.
#[tracing::instrument(name = "api.send", skip(state, query, headers, body))]
pub async fn send_message(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<SendResponse>> {
    let token = extract_token(&query, &headers)
        .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))?;
    let sender = state
        .authenticator
        .authenticate(&token)
        .await
        .map_err(|_| AppError::Unauthorized("Invalid or expired token".to_string()))?;

    let Json(body) = body.map_err(|e| {
        let mut errors = BTreeMap::new();
        errors.insert("body", e.body_text());
        AppError::Validation(errors)
    })?;

    let request = validate(&sender, &body).map_err(|errors| {
        tracing::warn!(user_id = %sender, ?errors, "Send validation failed");
        AppError::Validation(errors)
    })?;

    tracing::info!(from = %sender, to = %request.to_user_id, "Sending message");

    let outcome = state
        .delivery
        .send(&sender, &request.to_user_id, &request.message)
        .await
        .map_err(|e| match e {
            SendError::RateLimited { retry_after } => AppError::RateLimited { retry_after },
            SendError::Store(e) => AppError::Store(e),
        })?;

    Ok(Json(outcome.into()))
}
