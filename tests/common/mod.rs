//! Helpers shared by the integration tests: relay instances on a shared
//! in-process store, token minting and a small SSE body reader.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, BodyDataStream};
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use futures::StreamExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;

use sse_relay_service::config::Settings;
use sse_relay_service::server::{create_app, AppState};
use sse_relay_service::store::{CoordinationStore, MemoryStore};

pub const TEST_SECRET: &str = "your-super-secret-jwt-key-change-in-production";

/// How long a test waits for the next SSE frame before giving up.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Instance {
    pub state: AppState,
    pub app: Router,
}

/// Start a relay instance on `store`, letting the caller adjust settings.
pub async fn instance_with(
    store: &Arc<MemoryStore>,
    server_id: &str,
    tweak: impl FnOnce(&mut Settings),
) -> Instance {
    let mut settings = Settings::for_memory_store(server_id);
    tweak(&mut settings);

    let shared: Arc<dyn CoordinationStore> = store.clone();
    let state = AppState::new(settings, shared).await.unwrap();
    let app = create_app(state.clone());
    Instance { state, app }
}

pub async fn instance(store: &Arc<MemoryStore>, server_id: &str) -> Instance {
    instance_with(store, server_id, |_| {}).await
}

pub fn token(user_id: &str) -> String {
    encode(
        &Header::default(),
        &json!({
            "userId": user_id,
            "exp": chrono::Utc::now().timestamp() + 3600,
        }),
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

pub async fn send(app: &Router, bearer: Option<&str>, body: Value) -> (StatusCode, Response<Body>) {
    let mut request = Request::builder()
        .method("POST")
        .uri("/send")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(bearer) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
    }
    let request = request.body(Body::from(body.to_string())).unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    (response.status(), response)
}

/// POST /send from `from` to `to` and return status plus JSON body.
pub async fn send_message(app: &Router, from: &str, to: &str, message: &str) -> (StatusCode, Value) {
    let (status, response) = send(
        app,
        Some(&token(from)),
        json!({ "toUserId": to, "message": message }),
    )
    .await;
    (status, json_body(response).await)
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.clone().oneshot(request).await.unwrap()
}

/// GET /events for `user_id`, optionally resuming from `last_event_id`.
pub async fn open_events(app: &Router, user_id: &str, last_event_id: Option<&str>) -> Response<Body> {
    let mut request = Request::builder()
        .uri(format!("/events?token={}", token(user_id)))
        .header(header::ACCEPT, "text/event-stream");
    if let Some(id) = last_event_id {
        request = request.header("last-event-id", id);
    }
    app.clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// Open an event stream and assert it was accepted.
pub async fn connect(app: &Router, user_id: &str, last_event_id: Option<&str>) -> SseReader {
    let response = open_events(app, user_id, last_event_id).await;
    assert_eq!(response.status(), StatusCode::OK);
    SseReader::new(response)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    pub data: Value,
    pub id: Option<String>,
}

pub struct SseReader {
    body: BodyDataStream,
    buf: String,
}

impl SseReader {
    pub fn new(response: Response<Body>) -> Self {
        Self {
            body: response.into_body().into_data_stream(),
            buf: String::new(),
        }
    }

    /// Next frame, or `None` when the stream ends or stalls.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(pos) = self.buf.find("\n\n") {
                let raw: String = self.buf.drain(..pos + 2).collect();
                if let Some(frame) = parse_frame(&raw) {
                    return Some(frame);
                }
                continue;
            }

            let chunk = tokio::time::timeout(FRAME_TIMEOUT, self.body.next())
                .await
                .ok()??
                .ok()?;
            self.buf.push_str(std::str::from_utf8(&chunk).ok()?);
        }
    }

    /// Skip frames until one named `event` arrives.
    pub async fn next_named(&mut self, event: &str) -> Option<Frame> {
        loop {
            let frame = self.next_frame().await?;
            if frame.event == event {
                return Some(frame);
            }
        }
    }

    /// True once the server has ended the stream.
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(FRAME_TIMEOUT, self.body.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}

fn parse_frame(raw: &str) -> Option<Frame> {
    let mut event = None;
    let mut data = None;
    let mut id = None;

    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            id = Some(value.trim().to_string());
        }
    }

    // Comment-only frames (keep-alives) carry no event
    let event = event?;
    let data = serde_json::from_str(&data.unwrap_or_default()).unwrap_or(Value::Null);
    Some(Frame { event, data, id })
}

/// Poll `check` until it holds or a couple of seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
