// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the error module.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::*;
use crate::protocol::{Request, RequestArgs};

#[test]
fn test_discarded_embeds_request() {
    let request = Request::new("req-1", RequestArgs::new("document", "get"), None);
    let err = Error::discarded(&request);

    let text = err.to_string();
    assert!(text.contains("not connected"));
    assert!(text.contains("req-1"));
    assert!(text.contains("document"));
}

#[test]
fn test_api_error_message() {
    let err = Error::Api {
        message: "Token expired".to_string(),
        status: 401,
        stack: None,
    };
    assert_eq!(err.to_string(), "api error [401]: Token expired");
}

#[test]
fn test_renewed_too_recently_names_delay() {
    let err = Error::RenewedTooRecently(500);
    assert!(err.to_string().contains("500ms"));
}
