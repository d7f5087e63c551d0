//! Redis pub/sub subscription with automatic reconnection.
//!
//! A background task owns the dedicated pub/sub connection. Channel changes
//! reach it through a command channel, inbound messages leave through an
//! unbounded mpsc. After a disconnect the task reconnects with exponential
//! backoff and re-subscribes every tracked channel.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::PubSub;
use tokio::sync::{mpsc, oneshot};

use crate::redis::{BackoffConfig, ExponentialBackoff, RedisPool};

use super::{BrokerMessage, BrokerSubscription, StoreError, Subscription};

enum Command {
    Subscribe(String, oneshot::Sender<Result<(), StoreError>>),
    Unsubscribe(String, oneshot::Sender<Result<(), StoreError>>),
    Close,
}

enum Event {
    Command(Option<Command>),
    Message(Option<redis::Msg>),
}

/// Whether the subscriber loop should keep running.
enum Flow {
    Continue,
    Stop,
}

pub(super) fn open(pool: Arc<RedisPool>, backoff: BackoffConfig) -> Subscription {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();

    tokio::spawn(run(pool, backoff, cmd_rx, msg_tx));

    (Arc::new(RedisSubscription { commands: cmd_tx }), msg_rx)
}

struct RedisSubscription {
    commands: mpsc::UnboundedSender<Command>,
}

impl RedisSubscription {
    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), StoreError>>) -> Command,
    ) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(build(ack_tx))
            .map_err(|_| StoreError::SubscriptionClosed)?;
        ack_rx.await.map_err(|_| StoreError::SubscriptionClosed)?
    }
}

#[async_trait]
impl BrokerSubscription for RedisSubscription {
    async fn subscribe(&self, channel: &str) -> Result<(), StoreError> {
        let channel = channel.to_string();
        self.request(|ack| Command::Subscribe(channel, ack)).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        let channel = channel.to_string();
        self.request(|ack| Command::Unsubscribe(channel, ack)).await
    }

    async fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

async fn run(
    pool: Arc<RedisPool>,
    backoff: BackoffConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    out: mpsc::UnboundedSender<BrokerMessage>,
) {
    let mut channels: HashSet<String> = HashSet::new();
    let mut backoff = ExponentialBackoff::new(backoff);

    loop {
        match connect(&pool, &channels).await {
            Ok(mut pubsub) => {
                if backoff.attempt() > 0 {
                    tracing::info!(
                        channels = channels.len(),
                        "Redis subscriber reconnected"
                    );
                }
                backoff.reset();
                pool.health().set_connected();

                if let Flow::Stop = pump(&mut pubsub, &mut commands, &mut channels, &out).await {
                    break;
                }
                pool.health().set_reconnecting();
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = backoff.attempt(), "Redis subscriber connect failed");
                pool.health().set_reconnecting();
            }
        }

        let delay = backoff.next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting Redis subscriber");
        if let Flow::Stop = wait_offline(delay, &mut commands, &mut channels).await {
            break;
        }
    }

    tracing::debug!("Redis subscriber stopped");
}

async fn connect(pool: &RedisPool, channels: &HashSet<String>) -> Result<PubSub, StoreError> {
    let mut pubsub = pool.pubsub().await?;
    for channel in channels {
        pubsub.subscribe(channel).await?;
    }
    Ok(pubsub)
}

/// Forward messages and apply channel changes until the connection drops.
async fn pump(
    pubsub: &mut PubSub,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    channels: &mut HashSet<String>,
    out: &mpsc::UnboundedSender<BrokerMessage>,
) -> Flow {
    loop {
        let event = {
            let mut stream = pubsub.on_message();
            tokio::select! {
                cmd = commands.recv() => Event::Command(cmd),
                msg = stream.next() => Event::Message(msg),
            }
        };

        match event {
            Event::Command(None) | Event::Command(Some(Command::Close)) => return Flow::Stop,
            Event::Command(Some(Command::Subscribe(channel, ack))) => {
                let result = pubsub.subscribe(&channel).await;
                channels.insert(channel);
                match result {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        // Tracked anyway; the reconnect re-subscribes it
                        tracing::warn!(error = %e, "Redis SUBSCRIBE failed");
                        let _ = ack.send(Err(e.into()));
                        return Flow::Continue;
                    }
                }
            }
            Event::Command(Some(Command::Unsubscribe(channel, ack))) => {
                channels.remove(&channel);
                match pubsub.unsubscribe(&channel).await {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Redis UNSUBSCRIBE failed");
                        let _ = ack.send(Err(e.into()));
                        return Flow::Continue;
                    }
                }
            }
            Event::Message(Some(msg)) => {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to get message payload");
                        continue;
                    }
                };
                let message = BrokerMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if out.send(message).is_err() {
                    // Consumer gone
                    return Flow::Stop;
                }
            }
            Event::Message(None) => {
                tracing::warn!("Redis message stream ended");
                return Flow::Continue;
            }
        }
    }
}

/// Sleep out a backoff delay while still recording channel changes, which
/// take effect on the next connection.
async fn wait_offline(
    delay: std::time::Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    channels: &mut HashSet<String>,
) -> Flow {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return Flow::Continue,
            cmd = commands.recv() => match cmd {
                None | Some(Command::Close) => return Flow::Stop,
                Some(Command::Subscribe(channel, ack)) => {
                    channels.insert(channel);
                    let _ = ack.send(Ok(()));
                }
                Some(Command::Unsubscribe(channel, ack)) => {
                    channels.remove(&channel);
                    let _ = ack.send(Ok(()));
                }
            },
        }
    }
}
