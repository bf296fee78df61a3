//! Realtime insert channel over the hosted store's Phoenix websocket.
//!
//! One background task owns the socket: it joins the `postgres_changes`
//! channel for INSERTs on the photos table, keeps it alive with heartbeats
//! and reconnects with exponential backoff. Every successful rejoin after
//! the first emits [`RealtimeEvent::Resynced`] so consumers can reconcile
//! inserts missed while disconnected.

use super::{InsertSubscription, RealtimeEvent, StorageError};
use crate::config::FeedConfig;
use crate::model::Photo;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{Sink, SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel name the gallery subscribes under
pub const CHANNEL_NAME: &str = "photos-realtime";

/// Realtime channel settings derived from configuration
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    /// Websocket endpoint including the api key and protocol version
    pub endpoint: String,
    /// Token sent with the join request
    pub access_token: String,
    /// Phoenix topic, `realtime:<channel>`
    pub topic: String,
    /// Database schema of the watched table
    pub schema: String,
    /// Watched table
    pub table: String,
    pub heartbeat: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl RealtimeSettings {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        table: &str,
        feed: &FeedConfig,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            endpoint: websocket_endpoint(base_url, anon_key)?,
            access_token: anon_key.to_string(),
            topic: format!("realtime:{CHANNEL_NAME}"),
            schema: "public".to_string(),
            table: table.to_string(),
            heartbeat: feed.heartbeat(),
            reconnect_base_delay: feed.reconnect_base_delay(),
            reconnect_max_delay: feed.reconnect_max_delay(),
        })
    }
}

/// Derive the websocket endpoint from the store's HTTP base URL
pub fn websocket_endpoint(base_url: &str, anon_key: &str) -> Result<String, StorageError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| StorageError::Realtime(format!("invalid store URL: {e}")))?;

    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(StorageError::Realtime(format!(
                "unsupported store URL scheme {other:?}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| StorageError::Realtime(format!("cannot switch scheme to {scheme}")))?;

    let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", "1.0.0");

    Ok(url.to_string())
}

/// Start the channel task and hand back its subscription
pub fn subscribe(settings: RealtimeSettings) -> InsertSubscription {
    let cancel = CancellationToken::new();
    let (tx, subscription) = InsertSubscription::channel(cancel.clone());
    tokio::spawn(run_channel(settings, tx, cancel));
    subscription
}

/// Phoenix wire message
#[derive(Debug, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

/// What a decoded frame means for the channel
#[derive(Debug, PartialEq)]
enum Frame {
    Joined,
    JoinRejected(String),
    Insert(Photo),
    ChannelError(String),
    Ignored,
}

enum SessionEnd {
    /// Cancelled or nobody is listening any more
    Stopped,
    /// The server closed the socket
    Closed,
}

async fn run_channel(
    settings: RealtimeSettings,
    tx: mpsc::UnboundedSender<RealtimeEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = reconnect_backoff(&settings);
    let mut joined_once = false;

    loop {
        match run_session(&settings, &tx, &cancel, &mut joined_once, &mut backoff).await {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::Closed) => warn!(topic = %settings.topic, "Realtime socket closed by server"),
            Err(e) => warn!(topic = %settings.topic, error = %e, "Realtime session failed"),
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or(settings.reconnect_max_delay);
        debug!(delay_ms = delay.as_millis(), "Reconnecting realtime channel");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(topic = %settings.topic, "Realtime channel task stopped");
}

/// Backoff between reconnect attempts; never gives up
fn reconnect_backoff(settings: &RealtimeSettings) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: settings.reconnect_base_delay,
        max_interval: settings.reconnect_max_delay,
        max_elapsed_time: None,
        ..Default::default()
    }
}

async fn run_session(
    settings: &RealtimeSettings,
    tx: &mpsc::UnboundedSender<RealtimeEvent>,
    cancel: &CancellationToken,
    joined_once: &mut bool,
    backoff: &mut ExponentialBackoff,
) -> Result<SessionEnd, StorageError> {
    let connect = tokio_tungstenite::connect_async(settings.endpoint.as_str());
    let (socket, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionEnd::Stopped),
        result = connect => result.map_err(|e| StorageError::Realtime(format!("connect failed: {e}")))?,
    };
    let (mut sink, mut stream) = socket.split();

    let mut next_ref = 0u64;
    let mut make_ref = move || {
        next_ref += 1;
        next_ref.to_string()
    };

    let join_ref = make_ref();
    send(&mut sink, &join_message(settings, &join_ref)).await?;

    let mut heartbeat = tokio::time::interval(settings.heartbeat);
    // first tick fires immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = send(&mut sink, &leave_message(settings, &make_ref())).await;
                let _ = sink.close().await;
                return Ok(SessionEnd::Stopped);
            }
            _ = heartbeat.tick() => {
                send(&mut sink, &heartbeat_message(&make_ref())).await?;
            }
            frame = stream.next() => {
                let message = match frame {
                    None => return Ok(SessionEnd::Closed),
                    Some(Err(e)) => return Err(StorageError::Realtime(e.to_string())),
                    Some(Ok(message)) => message,
                };

                match message {
                    Message::Text(text) => {
                        match decode_frame(&text, &join_ref, &settings.topic) {
                            Ok(Frame::Joined) => {
                                info!(topic = %settings.topic, table = %settings.table, "Realtime channel joined");
                                backoff.reset();
                                if *joined_once && tx.send(RealtimeEvent::Resynced).is_err() {
                                    return Ok(SessionEnd::Stopped);
                                }
                                *joined_once = true;
                            }
                            Ok(Frame::Insert(photo)) => {
                                debug!(photo_id = %photo.id, "Realtime insert received");
                                if tx.send(RealtimeEvent::Insert(photo)).is_err() {
                                    return Ok(SessionEnd::Stopped);
                                }
                            }
                            Ok(Frame::JoinRejected(reason)) => {
                                return Err(StorageError::Realtime(format!("join rejected: {reason}")));
                            }
                            Ok(Frame::ChannelError(reason)) => {
                                return Err(StorageError::Realtime(reason));
                            }
                            Ok(Frame::Ignored) => {}
                            Err(e) => warn!(error = %e, "Skipping undecodable realtime frame"),
                        }
                    }
                    Message::Close(_) => return Ok(SessionEnd::Closed),
                    _ => {}
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: &PhoenixMessage) -> Result<(), StorageError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|e| StorageError::Realtime(e.to_string()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| StorageError::Realtime(e.to_string()))
}

fn join_message(settings: &RealtimeSettings, reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: settings.topic.clone(),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "INSERT",
                    "schema": settings.schema,
                    "table": settings.table,
                }],
            },
            "access_token": settings.access_token,
        }),
        reference: Some(reference.to_string()),
    }
}

fn heartbeat_message(reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

fn leave_message(settings: &RealtimeSettings, reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: settings.topic.clone(),
        event: "phx_leave".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

fn decode_frame(text: &str, join_ref: &str, topic: &str) -> Result<Frame, StorageError> {
    let message: PhoenixMessage =
        serde_json::from_str(text).map_err(|e| StorageError::Decode(e.to_string()))?;

    match message.event.as_str() {
        "phx_reply" if message.reference.as_deref() == Some(join_ref) => {
            let status = message
                .payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if status == "ok" {
                Ok(Frame::Joined)
            } else {
                let reason = message
                    .payload
                    .get("response")
                    .map(Value::to_string)
                    .unwrap_or_else(|| status.to_string());
                Ok(Frame::JoinRejected(reason))
            }
        }
        "postgres_changes" if message.topic == topic => {
            let data = message
                .payload
                .get("data")
                .ok_or_else(|| StorageError::Decode("postgres_changes without data".to_string()))?;

            if data.get("type").and_then(Value::as_str) != Some("INSERT") {
                return Ok(Frame::Ignored);
            }

            let record = data
                .get("record")
                .cloned()
                .ok_or_else(|| StorageError::Decode("INSERT without record".to_string()))?;
            let photo: Photo =
                serde_json::from_value(record).map_err(|e| StorageError::Decode(e.to_string()))?;

            Ok(Frame::Insert(photo))
        }
        "phx_error" | "phx_close" if message.topic == topic => Ok(Frame::ChannelError(format!(
            "channel {}: {}",
            message.event, message.payload
        ))),
        _ => Ok(Frame::Ignored),
    }
}
