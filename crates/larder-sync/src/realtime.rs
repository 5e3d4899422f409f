//! WebSocket change feed for the hosted backend.
//!
//! Each subscription joins a Phoenix channel `realtime:public:<collection>`
//! with a `postgres_changes` binding and turns the pushed rows into
//! [`FeedMessage`]s. The connection is kept alive with heartbeats and
//! re-established with exponential backoff; every successful rejoin after
//! the first emits [`FeedMessage::Resync`] since events may have been missed
//! while disconnected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::entity::{Entity, Record};
use crate::error::RemoteError;
use crate::key::Filter;
use crate::remote::{ChangeFeed, ChangeFeedEvent, ChangeKind, FeedMessage, FeedStream};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const READ_TIMEOUT: Duration = Duration::from_secs(90);
const PROTOCOL_VERSION: &str = "1.0.0";
const JOIN_REF: &str = "1";

/// Change feed over the realtime WebSocket endpoint.
pub struct RealtimeFeed {
    url: String,
    api_key: String,
    access_token: Arc<RwLock<Option<String>>>,
    channel_capacity: usize,
}

impl RealtimeFeed {
    /// Feed for the project at `base_url` (`http(s)://` or `ws(s)://`).
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: Arc::new(RwLock::new(None)),
            channel_capacity: 1024,
        }
    }

    /// Buffered messages per subscription.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Token sent when joining channels; applies to new subscriptions.
    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    fn socket_url(&self) -> String {
        let base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.url.clone()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn={}",
            base, self.api_key, PROTOCOL_VERSION
        )
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, collection: &str, filter: &Filter) -> Result<FeedStream, RemoteError> {
        let access_token = self.access_token.read().await.clone();
        let worker = ChannelWorker {
            url: self.socket_url(),
            topic: topic(collection),
            join: join_payload(collection, filter, access_token.as_deref()),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            read_timeout: READ_TIMEOUT,
        };

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(worker.run(tx, shutdown_rx));

        Ok(FeedStream {
            events: ReceiverStream::new(rx).boxed(),
            unsubscribe: Box::new(move || {
                let _ = shutdown_tx.send(true);
            }),
        })
    }
}

fn topic(collection: &str) -> String {
    format!("realtime:public:{}", collection)
}

/// `phx_join` payload binding all change events of one table.
///
/// The server accepts a single equality filter per binding; further scope
/// fields are enforced when events are applied.
fn join_payload(collection: &str, filter: &Filter, access_token: Option<&str>) -> Value {
    let mut binding = json!({
        "event": "*",
        "schema": "public",
        "table": collection,
    });
    if let Some((field, value)) = filter.iter().next() {
        binding["filter"] = Value::String(format!("{}=eq.{}", field, value));
    }

    let mut payload = json!({
        "config": {
            "broadcast": {"self": false},
            "presence": {"key": ""},
            "postgres_changes": [binding],
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    payload
}

fn phoenix_message(topic: &str, event: &str, payload: Value, reference: &str) -> String {
    json!({
        "topic": topic,
        "event": event,
        "payload": payload,
        "ref": reference,
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Option<Record>,
    #[serde(default)]
    old_record: Option<Record>,
}

/// Decoded server message.
#[derive(Debug, PartialEq)]
enum Inbound {
    Change(ChangeFeedEvent),
    Joined,
    JoinRejected(String),
    ChannelError(String),
    Ignored,
}

fn parse_message(text: &str, topic: &str) -> Result<Inbound, RemoteError> {
    let message: PhoenixMessage = serde_json::from_str(text)?;
    if message.topic != topic {
        return Ok(Inbound::Ignored);
    }

    match message.event.as_str() {
        "postgres_changes" => {
            let payload: ChangePayload = serde_json::from_value(message.payload)?;
            let data = payload.data;
            let row = match data.kind {
                ChangeKind::Delete => data.old_record,
                ChangeKind::Insert | ChangeKind::Update => data.record,
            };
            let record = row
                .and_then(Entity::from_record)
                .ok_or_else(|| RemoteError::InvalidResponse(format!("{} event without row id", data.kind)))?;
            Ok(Inbound::Change(ChangeFeedEvent {
                kind: data.kind,
                record,
            }))
        }
        "phx_reply" if message.reference.as_deref() == Some(JOIN_REF) => {
            let status = message.payload.get("status").and_then(Value::as_str);
            if status == Some("ok") {
                Ok(Inbound::Joined)
            } else {
                Ok(Inbound::JoinRejected(message.payload["response"].to_string()))
            }
        }
        "phx_error" | "phx_close" => Ok(Inbound::ChannelError(message.event)),
        "system" => {
            let failed = message.payload.get("status").and_then(Value::as_str) == Some("error");
            if failed {
                Ok(Inbound::ChannelError(message.payload["message"].to_string()))
            } else {
                Ok(Inbound::Ignored)
            }
        }
        _ => Ok(Inbound::Ignored),
    }
}

/// Connection loop for one channel subscription.
struct ChannelWorker {
    url: String,
    topic: String,
    join: Value,
    heartbeat_interval: Duration,
    /// Longest silence from the server before the connection counts as dead.
    read_timeout: Duration,
}

impl ChannelWorker {
    async fn run(self, tx: mpsc::Sender<FeedMessage>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        let mut joined_before = false;

        loop {
            if *shutdown_rx.borrow() {
                debug!(topic = %self.topic, "realtime channel shutting down");
                return;
            }

            info!(topic = %self.topic, "connecting to realtime");
            match self
                .connect_and_process(&tx, &mut shutdown_rx, &mut backoff, &mut joined_before)
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    error!(
                        topic = %self.topic,
                        error = %e,
                        retry_in = ?wait,
                        "realtime connection error, reconnecting"
                    );
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Connect, join and forward messages until error or shutdown.
    async fn connect_and_process(
        &self,
        tx: &mpsc::Sender<FeedMessage>,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
        joined_before: &mut bool,
    ) -> Result<(), RemoteError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RemoteError::WebSocket(format!("connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(phoenix_message(&self.topic, "phx_join", self.join.clone(), JOIN_REF)))
            .await
            .map_err(|e| RemoteError::WebSocket(format!("join failed: {}", e)))?;

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        let read_deadline = tokio::time::sleep(self.read_timeout);
        tokio::pin!(read_deadline);
        let mut next_ref: u64 = 2;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    // A dropped sender means the subscription is gone.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let leave = phoenix_message(&self.topic, "phx_leave", json!({}), &next_ref.to_string());
                        let _ = write.send(Message::Text(leave)).await;
                        let _ = write.close().await;
                        info!(topic = %self.topic, "left realtime channel");
                        return Ok(());
                    }
                }

                _ = heartbeat.tick() => {
                    let beat = phoenix_message("phoenix", "heartbeat", json!({}), &next_ref.to_string());
                    next_ref += 1;
                    write
                        .send(Message::Text(beat))
                        .await
                        .map_err(|e| RemoteError::WebSocket(format!("heartbeat failed: {}", e)))?;
                    trace!(topic = %self.topic, "heartbeat sent");
                }

                _ = &mut read_deadline => {
                    return Err(RemoteError::WebSocket("read timeout".to_string()));
                }

                frame = read.next() => {
                    read_deadline.as_mut().reset(Instant::now() + self.read_timeout);
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) => {
                            return Err(RemoteError::WebSocket("connection closed by server".to_string()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(RemoteError::WebSocket(format!("read error: {}", e))),
                        None => return Err(RemoteError::WebSocket("stream ended".to_string())),
                    };

                    let message = match parse_message(&text, &self.topic) {
                        Ok(Inbound::Change(event)) => FeedMessage::Event(event),
                        Ok(Inbound::Joined) => {
                            info!(topic = %self.topic, "joined realtime channel");
                            backoff.reset();
                            if !*joined_before {
                                *joined_before = true;
                                continue;
                            }
                            FeedMessage::Resync
                        }
                        Ok(Inbound::JoinRejected(reason)) => {
                            return Err(RemoteError::WebSocket(format!("join rejected: {}", reason)));
                        }
                        Ok(Inbound::ChannelError(reason)) => {
                            return Err(RemoteError::WebSocket(format!("channel error: {}", reason)));
                        }
                        Ok(Inbound::Ignored) => continue,
                        Err(e) => {
                            warn!(topic = %self.topic, error = %e, "failed to handle realtime message");
                            continue;
                        }
                    };

                    if tx.send(message).await.is_err() {
                        debug!(topic = %self.topic, "feed receiver dropped");
                        return Ok(());
                    }
                }
            }
        }
    }
}
