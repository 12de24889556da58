//! Real-time job event channel over WebSocket.
//!
//! [`WsChannel`] maintains a single process-wide connection to the job
//! service's event endpoint, joins per-job topics, and re-broadcasts
//! parsed [`ChannelMessage`]s through a [`tokio::sync::broadcast`]
//! channel. When the connection drops it retries with exponential
//! backoff and re-subscribes to the topics it was in.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::messages::{parse_message, ChannelMessage};
use crate::reconnect::{next_delay, ReconnectConfig};

/// Broadcast channel capacity for job events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Errors from the job event channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Tried to use the channel while disconnected.
    #[error("Not connected to the job event channel")]
    NotConnected,

    /// A protocol-level error on an established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Per-job topic membership and event delivery for the tracker.
#[async_trait]
pub trait JobChannel: Send + Sync {
    /// Establish the connection. Idempotent: connecting while already
    /// connected is a no-op.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Whether the connection is currently up.
    fn is_connected(&self) -> bool;

    /// Join the topic for a job's events. The server acknowledges
    /// subscriptions but the ack is not required for correctness.
    async fn subscribe_to_job(&self, job_id: &str) -> Result<(), ChannelError>;

    /// Leave a job's topic. Leaving while disconnected is a no-op.
    async fn unsubscribe_from_job(&self, job_id: &str) -> Result<(), ChannelError>;

    /// Subscribe to the stream of parsed channel messages.
    fn events(&self) -> broadcast::Receiver<ChannelMessage>;
}

/// WebSocket-backed [`JobChannel`].
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct WsChannel {
    inner: Arc<WsInner>,
}

struct WsInner {
    ws_url: String,
    reconnect: ReconnectConfig,
    events_tx: broadcast::Sender<ChannelMessage>,
    connected: AtomicBool,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    /// Topics to rejoin after a reconnect.
    topics: std::sync::Mutex<HashSet<String>>,
    /// Cancelled by `disconnect` to stop the read/reconnect loop.
    cancel: CancellationToken,
}

impl WsChannel {
    /// Create a channel targeting the job service event endpoint.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://localhost:3001`.
    pub fn new(ws_url: String) -> Self {
        Self::with_reconnect(ws_url, ReconnectConfig::default())
    }

    /// Create a channel with custom reconnection parameters.
    pub fn with_reconnect(ws_url: String, reconnect: ReconnectConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(WsInner {
                ws_url,
                reconnect,
                events_tx,
                connected: AtomicBool::new(false),
                sink: tokio::sync::Mutex::new(None),
                topics: std::sync::Mutex::new(HashSet::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        self.inner.cancel.cancel();
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        tracing::info!("Job event channel disconnected");
    }
}

#[async_trait]
impl JobChannel for WsChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        // Hold the sink lock across the dial so concurrent connect
        // calls cannot open two sockets.
        let mut sink_slot = self.inner.sink.lock().await;
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let stream = WsInner::dial(&self.inner.ws_url).await?;
        let (sink, source) = stream.split();
        *sink_slot = Some(sink);
        self.inner.connected.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_read_loop(inner, source));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn subscribe_to_job(&self, job_id: &str) -> Result<(), ChannelError> {
        tracing::debug!(job_id = %job_id, "Subscribing to job topic");
        self.inner
            .send_frame(serde_json::json!({
                "type": "subscribe_to_job",
                "jobId": job_id,
            }))
            .await?;

        // Remember the topic only once the join went out, so a failed
        // subscribe is not re-joined on every reconnect.
        self.inner
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string());
        Ok(())
    }

    async fn unsubscribe_from_job(&self, job_id: &str) -> Result<(), ChannelError> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);

        if !self.is_connected() {
            tracing::debug!(job_id = %job_id, "Skipping unsubscribe while disconnected");
            return Ok(());
        }

        tracing::debug!(job_id = %job_id, "Unsubscribing from job topic");
        self.inner
            .send_frame(serde_json::json!({
                "type": "unsubscribe_from_job",
                "jobId": job_id,
            }))
            .await
    }

    fn events(&self) -> broadcast::Receiver<ChannelMessage> {
        self.inner.events_tx.subscribe()
    }
}

impl WsInner {
    /// Open the WebSocket with a fresh client id on the query string so
    /// the server can address messages back to this client.
    async fn dial(ws_url: &str) -> Result<WsStream, ChannelError> {
        let client_id = uuid::Uuid::new_v4();
        let url = format!("{ws_url}/ws?clientId={client_id}");

        let (stream, _response) = connect_async(&url).await.map_err(|e| {
            ChannelError::Connection(format!("Failed to connect to {ws_url}: {e}"))
        })?;

        tracing::info!(
            client_id = %client_id,
            "Connected to job event channel at {}",
            ws_url,
        );

        Ok(stream)
    }

    async fn send_frame(&self, payload: serde_json::Value) -> Result<(), ChannelError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ChannelError::NotConnected)?;
        sink.send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| ChannelError::Protocol(format!("Failed to send frame: {e}")))
    }

    /// Rejoin every remembered topic after a reconnect.
    async fn resubscribe(&self) {
        let topics: Vec<String> = self
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();

        for job_id in topics {
            tracing::info!(job_id = %job_id, "Re-subscribing to job topic after reconnect");
            if let Err(e) = self
                .send_frame(serde_json::json!({
                    "type": "subscribe_to_job",
                    "jobId": job_id,
                }))
                .await
            {
                tracing::warn!(job_id = %job_id, error = %e, "Re-subscribe failed");
            }
        }
    }
}

/// Core connection loop: read frames -> reconnect -> resubscribe.
///
/// Runs until the cancellation token is triggered or reconnection is
/// abandoned.
async fn run_read_loop(inner: Arc<WsInner>, mut source: WsSource) {
    loop {
        read_frames(&inner, &mut source).await;

        // The connection has dropped.
        inner.connected.store(false, Ordering::SeqCst);
        inner.sink.lock().await.take();

        if inner.cancel.is_cancelled() {
            return;
        }

        tracing::info!("Job event channel lost, entering reconnect loop");
        match redial_with_backoff(&inner).await {
            Some(new_source) => {
                source = new_source;
                inner.resubscribe().await;
            }
            None => {
                tracing::warn!("Gave up reconnecting to job event channel");
                return;
            }
        }
    }
}

/// Read frames until the WebSocket closes or errors.
async fn read_frames(inner: &WsInner, source: &mut WsSource) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match parse_message(&text) {
                Ok(message) => {
                    // SendError only means there are zero receivers.
                    let _ = inner.events_tx.send(message);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        raw_message = %text,
                        "Failed to parse channel message",
                    );
                }
            },
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "Job event channel closed by server");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(error = %e, "Channel receive error");
                break;
            }
        }
    }
}

/// Attempt to reconnect with exponential backoff.
///
/// Returns the new read half once a connection succeeds, or `None` if
/// cancelled or the attempt budget is spent.
async fn redial_with_backoff(inner: &Arc<WsInner>) -> Option<WsSource> {
    let config = &inner.reconnect;
    let mut delay = config.initial_delay;

    for attempt in 1..=config.max_attempts {
        tokio::select! {
            _ = inner.cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to job event channel",
        );

        tokio::select! {
            _ = inner.cancel.cancelled() => return None,
            result = WsInner::dial(&inner.ws_url) => {
                match result {
                    Ok(stream) => {
                        let (sink, source) = stream.split();
                        *inner.sink.lock().await = Some(sink);
                        inner.connected.store(true, Ordering::SeqCst);
                        tracing::info!(attempt, "Reconnected to job event channel");
                        return Some(source);
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    }
                }
            }
        }

        delay = next_delay(delay, config);
    }

    None
}
