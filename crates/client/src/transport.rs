// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Transport abstraction for the engine's upstream connection.
//!
//! Provides a trait-based transport layer that enables:
//! - Real WebSocket connections for production
//! - Mock transports for unit testing
//!
//! Adapters push their lifecycle changes and inbound messages into an event
//! channel handed to the engine at construction; the engine consumes it from
//! a single dispatcher task.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use sg_core::protocol::Request;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<TransportError> for sg_core::Error {
    fn from(err: TransportError) -> Self {
        sg_core::Error::Transport(err.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Lifecycle changes and inbound traffic raised by a transport adapter.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// First successful connection.
    Connected,
    /// Successful connection after a previous one was lost.
    Reconnected,
    /// A connection attempt failed.
    ConnectError { message: String },
    /// The connection closed.
    Disconnected,
    /// The connection broke with a network-level error.
    NetworkError { message: String },
    /// One inbound payload, routed by its `room` key (a request id for
    /// responses, a channel id for notifications).
    Message { room: String, payload: Value },
}

/// Transport trait implemented identically by every adapter.
///
/// This trait abstracts over the actual transport mechanism, allowing
/// for easy testing with mock implementations.
pub trait Transport: Send + Sync + 'static {
    /// Initiate a connection attempt.
    fn connect(&self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Transmit one request. Best-effort: silently dropped when the
    /// underlying socket is not open.
    fn send(&self, request: &Request);

    /// Release the transport. No reconnection is attempted afterwards.
    fn close(&self);

    /// Check if connected.
    fn is_connected(&self) -> bool;

    /// Whether this adapter retries on its own after losing the connection.
    fn auto_reconnect(&self) -> bool;
}

/// Configuration for [`WebSocketTransport`].
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// URL of the remote endpoint.
    pub url: String,
    /// Retry automatically after a lost connection.
    pub auto_reconnect: bool,
    /// Delay between reconnection attempts.
    pub reconnection_delay: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            url: "ws://localhost:7512".to_string(),
            auto_reconnect: true,
            reconnection_delay: Duration::from_secs(1),
        }
    }
}

/// WebSocket transport implementation using tokio-tungstenite.
pub struct WebSocketTransport {
    ctx: Arc<WsContext>,
}

struct WsContext {
    config: WebSocketConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Sender feeding the writer task, present while the socket is open.
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    was_connected: AtomicBool,
    closed: AtomicBool,
}

fn lock_outgoing(ctx: &WsContext) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
    ctx.outgoing.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WebSocketTransport {
    /// Creates the transport and the event channel the engine consumes.
    pub fn new(config: WebSocketConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport {
            ctx: Arc::new(WsContext {
                config,
                events,
                outgoing: Mutex::new(None),
                connected: AtomicBool::new(false),
                was_connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };
        (transport, events_rx)
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        let ctx = Arc::clone(&self.ctx);
        Box::pin(async move {
            ctx.closed.store(false, Ordering::SeqCst);
            establish(ctx).await
        })
    }

    fn send(&self, request: &Request) {
        let guard = lock_outgoing(&self.ctx);
        let Some(tx) = guard.as_ref() else {
            tracing::trace!(request_id = %request.request_id, "socket not open, request dropped");
            return;
        };
        match request.to_json() {
            Ok(json) => {
                let _ = tx.send(Message::Text(json.into()));
            }
            Err(err) => tracing::warn!("failed to serialize outgoing request: {err}"),
        }
    }

    fn close(&self) {
        self.ctx.closed.store(true, Ordering::SeqCst);
        self.ctx.connected.store(false, Ordering::SeqCst);
        // dropping the sender makes the writer task send a Close frame
        *lock_outgoing(&self.ctx) = None;
    }

    fn is_connected(&self) -> bool {
        self.ctx.connected.load(Ordering::SeqCst)
    }

    fn auto_reconnect(&self) -> bool {
        self.ctx.config.auto_reconnect
    }
}

/// Opens the socket, wires the reader/writer tasks and raises the
/// connect/reconnect event.
async fn establish(ctx: Arc<WsContext>) -> TransportResult<()> {
    use futures_util::StreamExt;

    let (ws_stream, _) = tokio_tungstenite::connect_async(&ctx.config.url)
        .await
        .map_err(|e| {
            let message = e.to_string();
            let _ = ctx.events.send(TransportEvent::ConnectError {
                message: message.clone(),
            });
            TransportError::ConnectionFailed(message)
        })?;

    let (sink, stream) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    *lock_outgoing(&ctx) = Some(out_tx);
    ctx.connected.store(true, Ordering::SeqCst);

    let was_connected = ctx.was_connected.swap(true, Ordering::SeqCst);
    let _ = ctx.events.send(if was_connected {
        TransportEvent::Reconnected
    } else {
        TransportEvent::Connected
    });

    tokio::spawn(write_loop(sink, out_rx));
    tokio::spawn(read_loop(ctx, stream));
    Ok(())
}

async fn write_loop<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Message>)
where
    S: futures_util::Sink<Message> + Unpin,
{
    use futures_util::SinkExt;

    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            // the reader observes the same failure and drives recovery
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(ctx: Arc<WsContext>, mut stream: S)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send,
{
    use futures_util::StreamExt;

    let mut errored = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => {
                let payload: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!("unparseable inbound message dropped: {err}");
                        continue;
                    }
                };
                let room = payload
                    .get("room")
                    .and_then(Value::as_str)
                    .or_else(|| payload.get("requestId").and_then(Value::as_str))
                    .map(str::to_string);
                let Some(room) = room else {
                    tracing::warn!("inbound message without routing key dropped");
                    continue;
                };
                let _ = ctx.events.send(TransportEvent::Message { room, payload });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                errored = true;
                let _ = ctx.events.send(TransportEvent::NetworkError {
                    message: err.to_string(),
                });
                break;
            }
        }
    }

    ctx.connected.store(false, Ordering::SeqCst);
    *lock_outgoing(&ctx) = None;

    let closed = ctx.closed.load(Ordering::SeqCst);
    if ctx.config.auto_reconnect && !closed {
        if !errored {
            // unclean server-side close, surface it like a network drop
            let _ = ctx.events.send(TransportEvent::NetworkError {
                message: "connection lost".to_string(),
            });
        }
        retry(ctx).await;
    } else {
        let _ = ctx.events.send(TransportEvent::Disconnected);
    }
}

// boxed to break the establish -> read_loop -> retry type cycle
fn retry(ctx: Arc<WsContext>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            tokio::time::sleep(ctx.config.reconnection_delay).await;
            if ctx.closed.load(Ordering::SeqCst) {
                return;
            }
            if establish(Arc::clone(&ctx)).await.is_ok() {
                return;
            }
        }
    })
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
