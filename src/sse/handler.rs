//! SSE handler implementation.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use chrono::{SecondsFormat, Utc};
use futures::stream::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::auth::{extract_token, TokenQuery};
use crate::connection_manager::{Connection, EventName, OutboundFrame, WriteOptions};
use crate::error::AppError;
use crate::event_log::ReplayCursor;
use crate::metrics::{ConnectionMetrics, MessageMetrics};
use crate::server::AppState;
use crate::store::keys;

/// How long a retired duplicate gets to receive its `reconnect` notice
const RETIRE_NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// `GET /events`
#[tracing::instrument(
    name = "sse.connect",
    skip(state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user_id = authenticate(&state, &query, &headers).await?;

    if state.drain.is_draining() {
        ConnectionMetrics::record_rejected("draining");
        tracing::warn!(user_id = %user_id, "Rejecting connection, server draining");
        return Err(AppError::Draining {
            retry_after: state.settings.drain.reject_retry_after_seconds,
        });
    }

    // A replacement does not add to the connection count
    let existing = state.registry.connection(&user_id);
    if existing.is_none() && state.registry.size() >= state.settings.server.max_connections {
        ConnectionMetrics::record_rejected("capacity");
        tracing::warn!(user_id = %user_id, "Rejecting connection, capacity exceeded");
        return Err(AppError::CapacityExceeded {
            retry_after: state.settings.drain.reject_retry_after_seconds,
        });
    }

    let cursor = requested_cursor(&query, &headers);

    if let Some(previous) = existing {
        retire_duplicate(&state, previous).await;
    }

    // Subscribed before the session is visible, so no live send can miss us
    subscribe(&state, &user_id).await;

    let (tx, rx) = mpsc::channel::<OutboundFrame>(state.settings.sse.send_buffer.max(1));
    let conn = state.registry.register(&user_id, tx).await;
    ConnectionMetrics::record_opened();

    // A closing connection's cleanup may have unsubscribed in between
    subscribe(&state, &user_id).await;

    tracing::info!(
        connection_id = %conn.id,
        user_id = %user_id,
        cursor = ?cursor.map(|c| c.to_string()),
        "SSE connection established"
    );

    tokio::spawn(bootstrap(state.clone(), conn.clone(), cursor));

    let mut response = Sse::new(create_sse_stream(rx, conn, state)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    Ok(response)
}

async fn subscribe(state: &AppState, user_id: &str) {
    if let Err(e) = state.pubsub.subscribe(user_id).await {
        tracing::error!(user_id = %user_id, error = %e, "Failed to subscribe user channel");
    }
}

async fn authenticate(
    state: &AppState,
    query: &TokenQuery,
    headers: &HeaderMap,
) -> Result<String, AppError> {
    let Some(token) = extract_token(query, headers) else {
        ConnectionMetrics::record_rejected("unauthorized");
        tracing::warn!("SSE connection rejected, no token");
        return Err(AppError::Unauthorized("Authentication required".to_string()));
    };

    match state.authenticator.authenticate(&token).await {
        Ok(user_id) => {
            ConnectionMetrics::record_auth(true);
            Ok(user_id)
        }
        Err(e) => {
            ConnectionMetrics::record_auth(false);
            ConnectionMetrics::record_rejected("unauthorized");
            tracing::warn!(error = %e, "SSE connection rejected, invalid token");
            Err(AppError::Unauthorized("Invalid or expired token".to_string()))
        }
    }
}

/// Resume position from the `Last-Event-ID` header, else `?lastEventId=`.
fn requested_cursor(query: &TokenQuery, headers: &HeaderMap) -> Option<ReplayCursor> {
    let raw = headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .or(query.last_event_id.as_deref())
        .map(str::trim)
        .filter(|v| !v.is_empty())?;

    match raw.parse() {
        Ok(cursor) => Some(cursor),
        Err(e) => {
            tracing::warn!(last_event_id = %raw, error = %e, "Ignoring unparseable Last-Event-ID");
            None
        }
    }
}

async fn retire_duplicate(state: &AppState, previous: Arc<Connection>) {
    tracing::info!(
        user_id = %previous.user_id,
        connection_id = %previous.id,
        "Duplicate connection, closing existing"
    );

    let notice = state.registry.write_to_connection(
        &previous,
        EventName::Reconnect,
        json!({ "reason": "duplicate_connection" }),
        None,
        WriteOptions::default(),
    );
    if timeout(RETIRE_NOTICE_TIMEOUT, notice).await.is_err() {
        tracing::debug!(user_id = %previous.user_id, "Timeout sending reconnect notice");
    }

    previous.stop_heartbeat();
    state.registry.retire_local(&previous.user_id, previous.id);
}

/// Replay, inbox flush and the `connected` event, in that order, before
/// the connection accepts live traffic.
async fn bootstrap(state: AppState, conn: Arc<Connection>, requested: Option<ReplayCursor>) {
    let user_id = conn.user_id.clone();

    // On a server-side resume, queued messages are left to the inbox flush
    let (cursor, queued) = match requested {
        Some(cursor) => (Some(cursor), HashSet::new()),
        None if state.settings.sse.resume_without_cursor => {
            match stored_cursor(&state, &user_id).await {
                Some(cursor) => (Some(cursor), queued_ids(&state, &user_id).await),
                None => (None, HashSet::new()),
            }
        }
        None => (None, HashSet::new()),
    };

    if let Some(cursor) = cursor {
        let replayed = state
            .event_log
            .replay_to_except(&conn, Some(cursor), &queued)
            .await;
        if let Err(e) = replayed {
            tracing::warn!(user_id = %user_id, error = %e, "Replay failed");
        }
    }
    if conn.is_closed() {
        return;
    }

    let unread = match flush_inbox(&state, &conn).await {
        Some(unread) => unread,
        None => return,
    };

    let connected = json!({
        "userId": user_id,
        "serverId": state.registry.server_id(),
        "unread": unread,
        "at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    });
    if !state
        .registry
        .write_to_connection(&conn, EventName::Connected, connected, None, WriteOptions::default())
        .await
    {
        return;
    }

    conn.mark_live();
    state.heartbeat.start(&user_id);
}

async fn stored_cursor(state: &AppState, user_id: &str) -> Option<ReplayCursor> {
    match state.store.get(&keys::resume_cursor(user_id)).await {
        Ok(raw) => raw.and_then(|raw| raw.parse().ok()),
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to read resume cursor");
            None
        }
    }
}

async fn queued_ids(state: &AppState, user_id: &str) -> HashSet<u64> {
    state.inbox.pending_ids(user_id).await.unwrap_or_else(|e| {
        tracing::warn!(user_id = %user_id, error = %e, "Failed to read inbox");
        HashSet::new()
    })
}

/// Deliver queued messages framed by `queued_flush` markers. Returns the
/// number delivered, or `None` once the connection is gone.
async fn flush_inbox(state: &AppState, conn: &Arc<Connection>) -> Option<usize> {
    let user_id = conn.user_id.as_str();
    let queued = match state.inbox.flush(user_id).await {
        Ok(queued) => queued,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to flush inbox");
            Vec::new()
        }
    };

    // Anything replayed from the log already reached the client
    let pending: Vec<_> = queued
        .into_iter()
        .filter(|event| !conn.already_delivered(event.id))
        .collect();
    if pending.is_empty() {
        return Some(0);
    }

    let count = pending.len();
    let registry = &state.registry;
    if !registry
        .write_to_connection(
            conn,
            EventName::QueuedFlush,
            json!({ "phase": "start", "count": count }),
            None,
            WriteOptions::default(),
        )
        .await
    {
        return None;
    }

    for mut event in pending {
        event.queued = true;
        let id = event.id.to_string();
        if !registry
            .write_to_connection(conn, EventName::Message, event.to_value(), Some(&id), WriteOptions::default())
            .await
        {
            return None;
        }
    }

    if !registry
        .write_to_connection(
            conn,
            EventName::QueuedFlush,
            json!({ "phase": "end" }),
            None,
            WriteOptions::default(),
        )
        .await
    {
        return None;
    }

    MessageMetrics::record_inbox_flushed(count as u64);
    tracing::info!(user_id = %user_id, count, "Flushed offline inbox");
    Some(count)
}

/// Create the SSE event stream
fn create_sse_stream(
    mut rx: mpsc::Receiver<OutboundFrame>,
    conn: Arc<Connection>,
    state: AppState,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut closed = conn.closed_signal();
    // Dropped with the stream when the client goes away
    let cleanup_guard = CleanupGuard { conn, state };

    async_stream::stream! {
        let _guard = cleanup_guard;

        loop {
            // Frames queued before a close still go out
            let outbound = tokio::select! {
                biased;
                outbound = rx.recv() => outbound,
                _ = closed.wait_for(|c| *c) => None,
            };
            let Some(OutboundFrame { frame, flushed }) = outbound else {
                break;
            };

            yield Ok(frame.into_event());
            // Resumed only after the previous event was handed to the body
            let _ = flushed.send(());
        }
    }
}

/// Guard that performs cleanup when dropped
struct CleanupGuard {
    conn: Arc<Connection>,
    state: AppState,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let lifetime = self.conn.age();
        ConnectionMetrics::record_closed(lifetime);
        self.conn.stop_heartbeat();

        tracing::info!(
            connection_id = %self.conn.id,
            user_id = %self.conn.user_id,
            duration_secs = lifetime.as_secs_f64(),
            "SSE connection closed"
        );

        let conn = self.conn.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            state
                .registry
                .unregister_connection(&conn.user_id, conn.id)
                .await;
            // A replacement keeps using the subscription
            if !conn.was_replaced() && !state.registry.has(&conn.user_id) {
                state.pubsub.unsubscribe(&conn.user_id).await;
            }
        });
    }
}
