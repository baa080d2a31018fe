// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the transport module.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use super::{Transport, TransportEvent, WebSocketConfig};
use crate::test_helpers::MockTransport;
use sg_core::protocol::{Request, RequestArgs};

fn request(id: &str) -> Request {
    Request::new(id, RequestArgs::new("server", "now"), None)
}

#[test]
fn websocket_config_defaults() {
    let config = WebSocketConfig::default();
    assert_eq!(config.url, "ws://localhost:7512");
    assert!(config.auto_reconnect);
    assert_eq!(config.reconnection_delay, Duration::from_secs(1));
}

#[test]
fn transport_error_converts_to_engine_error() {
    let err: sg_core::Error =
        super::TransportError::ConnectionFailed("refused".to_string()).into();
    assert!(err.to_string().contains("refused"));
}

#[tokio::test]
async fn mock_transport_raises_connect_then_reconnect() {
    let (transport, _remote, mut events) = MockTransport::new();
    assert!(!transport.is_connected());

    transport.connect().await.unwrap();
    assert!(transport.is_connected());
    assert!(matches!(
        events.recv().await.unwrap(),
        TransportEvent::Connected
    ));

    transport.close();
    assert!(!transport.is_connected());

    transport.connect().await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        TransportEvent::Reconnected
    ));
}

#[tokio::test]
async fn mock_transport_records_outgoing() {
    let (transport, remote, _events) = MockTransport::new();
    transport.connect().await.unwrap();

    transport.send(&request("req-1"));
    transport.send(&request("req-2"));

    let sent = remote.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].request_id, "req-1");
    assert_eq!(sent[1].request_id, "req-2");
}

#[tokio::test]
async fn mock_transport_responder_answers_sends() {
    let (transport, remote, mut events) = MockTransport::new();
    remote.auto_respond();
    transport.connect().await.unwrap();
    // drain the connect event
    assert!(matches!(
        events.recv().await.unwrap(),
        TransportEvent::Connected
    ));

    transport.send(&request("req-1"));
    match events.recv().await.unwrap() {
        TransportEvent::Message { room, payload } => {
            assert_eq!(room, "req-1");
            assert_eq!(payload["status"], 200);
        }
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn mock_transport_failed_connect_raises_error() {
    let (transport, remote, mut events) = MockTransport::new();
    remote.set_connect_fail(true);

    assert!(transport.connect().await.is_err());
    assert!(!transport.is_connected());
    assert!(matches!(
        events.recv().await.unwrap(),
        TransportEvent::ConnectError { .. }
    ));
}
