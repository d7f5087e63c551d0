//! Connection handle and related types

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::frame::SseFrame;

/// Event ids remembered per connection for duplicate suppression.
const DELIVERED_WINDOW: usize = 1024;

/// A frame queued for the response stream. `flushed` fires once the stream
/// has handed the frame to the transport.
pub struct OutboundFrame {
    pub frame: SseFrame,
    pub flushed: oneshot::Sender<()>,
}

/// Handle for a single SSE connection
pub struct Connection {
    pub id: Uuid,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    started: Instant,
    sender: mpsc::Sender<OutboundFrame>,
    /// Serializes writes so frames and their acknowledgements stay in order
    write_lock: Mutex<()>,
    live: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    /// Set when a newer connection for the same user took over
    replaced: AtomicBool,
    delivered: StdMutex<BTreeSet<u64>>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(user_id: String, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            connected_at: Utc::now(),
            started: Instant::now(),
            sender,
            write_lock: Mutex::new(()),
            live: watch::Sender::new(false),
            closed: watch::Sender::new(false),
            replaced: AtomicBool::new(false),
            delivered: StdMutex::new(BTreeSet::new()),
            heartbeat: StdMutex::new(None),
        }
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Queue a frame and wait until it is flushed. Suspends while the
    /// outbound buffer is full. Returns false once the connection is closed.
    pub async fn write(&self, frame: SseFrame) -> bool {
        let _guard = self.write_lock.lock().await;
        if self.is_closed() {
            return false;
        }

        let (flushed_tx, flushed_rx) = oneshot::channel();
        let outbound = OutboundFrame {
            frame,
            flushed: flushed_tx,
        };

        let mut closed = self.closed.subscribe();
        tokio::select! {
            sent = self.sender.send(outbound) => {
                if sent.is_err() {
                    return false;
                }
            }
            _ = closed.wait_for(|c| *c) => return false,
        }

        tokio::select! {
            ack = flushed_rx => ack.is_ok(),
            _ = closed.wait_for(|c| *c) => false,
        }
    }

    pub fn mark_live(&self) {
        self.live.send_replace(true);
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Wait until the connection is marked live. False if it closes first.
    pub async fn wait_live(&self) -> bool {
        let mut live = self.live.subscribe();
        let mut closed = self.closed.subscribe();
        let ready = tokio::select! {
            ready = live.wait_for(|l| *l) => ready.is_ok(),
            _ = closed.wait_for(|c| *c) => false,
        };
        ready && !self.is_closed()
    }

    /// Mark the connection closed. Pending and future writes fail and the
    /// response stream ends; the heartbeat task stops on its own.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn mark_replaced(&self) {
        self.replaced.store(true, Ordering::Release);
        self.close();
    }

    pub fn was_replaced(&self) -> bool {
        self.replaced.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.sender.is_closed()
    }

    /// Receiver that turns true when the connection is closed.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn already_delivered(&self, event_id: u64) -> bool {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&event_id)
    }

    pub fn record_delivered(&self, event_id: u64) {
        let mut delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        delivered.insert(event_id);
        while delivered.len() > DELIVERED_WINDOW {
            delivered.pop_first();
        }
    }

    /// Install the heartbeat task. Returns false if one is already running.
    pub fn set_heartbeat(&self, start: impl FnOnce() -> JoinHandle<()>) -> bool {
        let mut slot = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        *slot = Some(start());
        true
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn stop_heartbeat(&self) {
        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

/// How a frame reaches the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Mark the payload with `"replayed": true`
    pub replayed: bool,
    /// Wait for the connection to go live and skip already-delivered ids
    pub live: bool,
}

impl WriteOptions {
    pub fn replayed() -> Self {
        Self {
            replayed: true,
            live: false,
        }
    }

    pub fn live() -> Self {
        Self {
            replayed: false,
            live: true,
        }
    }
}
