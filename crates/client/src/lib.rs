// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! surge: resilient client engine for a realtime data service.
//!
//! Maintains a persistent logical session over an unreliable transport:
//! connection drops are hidden from callers by buffering outgoing requests
//! while offline, replaying them in order on reconnection, correlating
//! asynchronous responses to their requests, and re-establishing
//! server-side subscriptions that existed before the disconnection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Engine    │────►│  Transport  │────►│   Remote    │
//! │  (facade)   │◄────│   (trait)   │◄────│   Service   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!    │    │    │
//!    │    │    └──► Correlator  (requestId → completion)
//!    │    └───────► OfflineQueue (FIFO, TTL + size bound)
//!    └────────────► Rooms       (pending / active subscriptions)
//! ```
//!
//! # Features
//!
//! - WebSocket transport with automatic reconnection
//! - Offline queue with TTL/size eviction, pluggable filter and loader
//! - Exactly-once response delivery per request
//! - Debounced subscription renewal and coordinated unsubscription
//! - Rate-limited lifecycle events with deferred listener dispatch

mod config;
mod correlator;
mod engine;
mod events;
mod queue;
mod room;
mod state;
mod transport;

pub use config::{EngineConfig, OfflineMode};
pub use engine::{Engine, QueryOptions, RoomHandle};
pub use events::{Event, EventKind, ListenerId};
pub use room::{RoomOptions, RoomSnapshot, RoomStatus, SubscriptionsSnapshot};
pub use state::ConnectionState;
pub use transport::{
    Transport, TransportError, TransportEvent, TransportResult, WebSocketConfig,
    WebSocketTransport,
};

pub use sg_core::{Error, Notification, Request, RequestArgs, Response, ResponseError, Result};

#[cfg(test)]
mod test_helpers;
