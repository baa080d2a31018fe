// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for engine tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use sg_core::protocol::Request;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::transport::{Transport, TransportEvent, TransportResult};

type Responder = Box<dyn Fn(&Request) -> Option<Value> + Send + Sync>;

/// Mock transport for testing without real sockets.
///
/// The paired [`MockRemote`] plays the part of the remote service: it
/// records outgoing requests, injects transport events, and optionally
/// answers requests through a responder closure.
pub struct MockTransport {
    shared: Arc<MockShared>,
}

pub struct MockRemote {
    shared: Arc<MockShared>,
}

struct MockShared {
    events: mpsc::UnboundedSender<TransportEvent>,
    outgoing: Mutex<Vec<Request>>,
    responder: Mutex<Option<Responder>>,
    connected: AtomicBool,
    was_connected: AtomicBool,
    auto_reconnect: AtomicBool,
    connect_should_fail: AtomicBool,
}

impl MockTransport {
    pub fn new() -> (Self, MockRemote, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            events,
            outgoing: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            connected: AtomicBool::new(false),
            was_connected: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(true),
            connect_should_fail: AtomicBool::new(false),
        });
        (
            MockTransport {
                shared: Arc::clone(&shared),
            },
            MockRemote { shared },
            events_rx,
        )
    }
}

impl Transport for MockTransport {
    fn connect(&self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if shared.connect_should_fail.load(Ordering::SeqCst) {
                let _ = shared.events.send(TransportEvent::ConnectError {
                    message: "mock failure".to_string(),
                });
                return Err(crate::transport::TransportError::ConnectionFailed(
                    "mock failure".to_string(),
                ));
            }
            shared.connected.store(true, Ordering::SeqCst);
            let was = shared.was_connected.swap(true, Ordering::SeqCst);
            let _ = shared.events.send(if was {
                TransportEvent::Reconnected
            } else {
                TransportEvent::Connected
            });
            Ok(())
        })
    }

    fn send(&self, request: &Request) {
        self.shared.outgoing.lock().unwrap().push(request.clone());
        let responder = self.shared.responder.lock().unwrap();
        if let Some(responder) = responder.as_ref() {
            if let Some(payload) = responder(request) {
                let _ = self.shared.events.send(TransportEvent::Message {
                    room: request.request_id.clone(),
                    payload,
                });
            }
        }
    }

    fn close(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn auto_reconnect(&self) -> bool {
        self.shared.auto_reconnect.load(Ordering::SeqCst)
    }
}

impl MockRemote {
    /// All requests handed to the transport so far.
    pub fn sent(&self) -> Vec<Request> {
        self.shared.outgoing.lock().unwrap().clone()
    }

    /// Requests filtered by action, in send order.
    pub fn sent_with_action(&self, action: &str) -> Vec<Request> {
        self.sent()
            .into_iter()
            .filter(|request| request.action == action)
            .collect()
    }

    /// Injects a transport event.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.shared.events.send(event);
    }

    /// Simulates a network-level connection loss.
    pub fn break_connection(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::NetworkError {
            message: "mock connection lost".to_string(),
        });
    }

    /// Simulates the transport reconnecting on its own.
    pub fn reconnect(&self) {
        self.shared.connected.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Reconnected);
    }

    /// Makes the next connect() attempts fail.
    pub fn set_connect_fail(&self, fail: bool) {
        self.shared.connect_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_auto_reconnect(&self, value: bool) {
        self.shared.auto_reconnect.store(value, Ordering::SeqCst);
    }

    /// Installs a closure answering requests as they are sent.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Request) -> Option<Value> + Send + Sync + 'static,
    {
        *self.shared.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Answers every request with a generic success. Subscribe requests
    /// get a room derived from their index and filters, so identical
    /// subscriptions share a room.
    pub fn auto_respond(&self) {
        self.set_responder(|request| Some(success_envelope(request)));
    }

    /// Sends a success response for one request.
    pub fn respond_ok(&self, request: &Request, result: Value) {
        self.emit(TransportEvent::Message {
            room: request.request_id.clone(),
            payload: json!({
                "requestId": request.request_id,
                "status": 200,
                "error": null,
                "result": result,
            }),
        });
    }

    /// Sends an error response for one request.
    pub fn respond_error(&self, request: &Request, status: i64, message: &str) {
        self.emit(TransportEvent::Message {
            room: request.request_id.clone(),
            payload: json!({
                "requestId": request.request_id,
                "status": status,
                "error": { "message": message, "status": status },
                "result": null,
            }),
        });
    }

    /// Delivers a notification on a channel.
    pub fn notify(&self, channel: &str, payload: Value) {
        self.emit(TransportEvent::Message {
            room: channel.to_string(),
            payload,
        });
    }
}

/// Standard success envelope for the auto responder.
pub fn success_envelope(request: &Request) -> Value {
    let result = match request.action.as_str() {
        "subscribe" => {
            let filters = serde_json::to_string(&request.body).unwrap_or_default();
            let room = format!(
                "room:{}:{}",
                request.index.clone().unwrap_or_default(),
                filters
            );
            json!({ "roomId": room, "channel": format!("chan:{room}") })
        }
        "checkToken" => json!({ "valid": true }),
        "count" => json!({ "count": 1 }),
        _ => json!({}),
    };
    json!({
        "requestId": request.request_id,
        "status": 200,
        "error": null,
        "result": result,
    })
}

/// Engine over a mock transport.
pub fn mock_engine(config: EngineConfig) -> (Engine, MockRemote) {
    let (transport, remote, events_rx) = MockTransport::new();
    let engine = Engine::new(transport, events_rx, config);
    (engine, remote)
}

/// Lets the dispatcher and spawned tasks drain.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Lets timers fire: advances the paused clock while draining tasks.
pub async fn settle_for(millis: u64) {
    settle().await;
    tokio::time::sleep(tokio::time::Duration::from_millis(millis)).await;
    settle().await;
}
