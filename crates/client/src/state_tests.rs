// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the connection state module.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::ConnectionState;
use yare::parameterized;

#[parameterized(
    connected = { ConnectionState::Connected, true },
    ready = { ConnectionState::Ready, true },
    initializing = { ConnectionState::Initializing, false },
    connecting = { ConnectionState::Connecting, false },
    offline = { ConnectionState::Offline, false },
    error = { ConnectionState::Error, false },
    disconnected = { ConnectionState::Disconnected, false },
)]
fn is_open(state: ConnectionState, expected: bool) {
    assert_eq!(state.is_open(), expected);
}

#[test]
fn transitional_states() {
    assert!(ConnectionState::Initializing.is_transitional());
    assert!(ConnectionState::Connecting.is_transitional());
    assert!(!ConnectionState::Offline.is_transitional());
    assert!(!ConnectionState::Ready.is_transitional());
}

#[test]
fn only_disconnected_is_terminal() {
    assert!(ConnectionState::Disconnected.is_terminal());
    assert!(!ConnectionState::Error.is_terminal());
    assert!(!ConnectionState::Offline.is_terminal());
}

#[test]
fn display_names() {
    assert_eq!(ConnectionState::Ready.to_string(), "ready");
    assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
}
