// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the request correlator.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use super::RequestCorrelator;
use serde_json::json;
use sg_core::protocol::Response;
use sg_core::Error;
use tokio::sync::oneshot;
use tokio::time::{advance, Instant};

fn response_ok(request_id: &str) -> Response {
    Response::from_value(json!({
        "requestId": request_id,
        "status": 200,
        "result": {"ok": true}
    }))
    .unwrap()
}

fn response_error(request_id: &str, message: &str, status: i64) -> Response {
    Response::from_value(json!({
        "requestId": request_id,
        "status": status,
        "error": {"message": message, "status": status},
        "result": null
    }))
    .unwrap()
}

#[tokio::test]
async fn resolve_delivers_response_once() {
    let mut correlator = RequestCorrelator::new();
    let (tx, rx) = oneshot::channel();
    correlator.register("req-1", "get", Some(tx));
    assert!(correlator.is_pending("req-1"));

    let disposition = correlator.resolve("req-1", response_ok("req-1")).unwrap();
    assert!(!disposition.token_expired);
    assert!(disposition.error.is_none());

    let outcome = rx.await.unwrap().unwrap();
    assert_eq!(outcome.result["ok"], true);

    // a duplicate response finds nothing
    assert!(!correlator.is_pending("req-1"));
    assert!(correlator.resolve("req-1", response_ok("req-1")).is_none());
}

#[tokio::test]
async fn resolve_classifies_expired_token() {
    let mut correlator = RequestCorrelator::new();
    let (tx, rx) = oneshot::channel();
    correlator.register("req-1", "get", Some(tx));

    let disposition = correlator
        .resolve("req-1", response_error("req-1", "Token expired", 401))
        .unwrap();
    assert!(disposition.token_expired);
    assert_eq!(disposition.error.unwrap().message, "Token expired");

    match rx.await.unwrap() {
        Err(Error::Api { status, message, .. }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "Token expired");
        }
        other => panic!("expected api error, got {other:?}"),
    }
}

#[tokio::test]
async fn logout_response_never_expires_token() {
    let mut correlator = RequestCorrelator::new();
    let (tx, _rx) = oneshot::channel();
    correlator.register("req-1", "logout", Some(tx));

    let disposition = correlator
        .resolve("req-1", response_error("req-1", "Token expired", 401))
        .unwrap();
    assert!(!disposition.token_expired);
    assert!(disposition.error.is_some());
}

#[tokio::test]
async fn generic_error_keeps_status_and_message() {
    let mut correlator = RequestCorrelator::new();
    let (tx, rx) = oneshot::channel();
    correlator.register("req-1", "create", Some(tx));

    let disposition = correlator
        .resolve("req-1", response_error("req-1", "Bad request", 400))
        .unwrap();
    assert!(!disposition.token_expired);

    match rx.await.unwrap() {
        Err(Error::Api { status, .. }) => assert_eq!(status, 400),
        other => panic!("expected api error, got {other:?}"),
    }
}

#[tokio::test]
async fn callbackless_registration_still_classifies() {
    let mut correlator = RequestCorrelator::new();
    correlator.register("req-1", "get", None);

    let disposition = correlator
        .resolve("req-1", response_error("req-1", "Token expired", 401))
        .unwrap();
    assert!(disposition.token_expired);
}

#[tokio::test]
async fn cancel_all_drops_waiters() {
    let mut correlator = RequestCorrelator::new();
    let (tx, rx) = oneshot::channel();
    correlator.register("req-1", "get", Some(tx));
    assert_eq!(correlator.pending_len(), 1);

    correlator.cancel_all();
    assert_eq!(correlator.pending_len(), 0);
    assert!(rx.await.is_err());
}

#[tokio::test(start_paused = true)]
async fn history_matches_are_consumed() {
    let mut correlator = RequestCorrelator::new();
    correlator.record_history("req-1");

    assert!(correlator.consume_own("req-1"));
    // consumed: a second lookup misses
    assert!(!correlator.consume_own("req-1"));
    assert!(!correlator.consume_own("unknown"));
}

#[tokio::test(start_paused = true)]
async fn history_expires_after_ttl() {
    let mut correlator = RequestCorrelator::new();
    correlator.record_history("old");
    advance(Duration::from_secs(11)).await;
    correlator.record_history("fresh");

    correlator.sweep_history(Instant::now(), Duration::from_secs(10));
    assert!(!correlator.consume_own("old"));
    assert!(correlator.consume_own("fresh"));
}
