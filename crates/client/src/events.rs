// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Engine event emission.
//!
//! Listeners are registered per event kind and invoked in registration
//! order. Dispatch is deferred: each listener runs on its own spawned task,
//! so a slow or panicking listener never blocks the emitting call nor the
//! other listeners.
//!
//! Connection-lifecycle events carry a last-emitted watermark and are
//! suppressed when re-fired within the configured `event_timeout` window.
//! Queue and diagnostic events are never suppressed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sg_core::protocol::Request;
use tokio::time::Instant;

/// A global engine event, carrying its payload.
#[derive(Debug, Clone)]
pub enum Event {
    Connected,
    Disconnected,
    Reconnected,
    /// A connection attempt failed.
    Error { message: String },
    /// An authentication attempt completed.
    LoginAttempt { success: bool },
    /// The stored auth token was invalidated.
    TokenExpired,
    /// The transport reported a network-level failure.
    NetworkError { message: String },
    /// A request was dropped because it could not be sent nor queued.
    Discarded { request: Request },
    /// A request entered the offline queue.
    OfflineQueuePush { request: Request },
    /// A request left the offline queue, by replay or eviction.
    OfflineQueuePop { request: Request },
    /// The server answered a request with an error.
    QueryError { message: String, request_id: String },
}

/// Discriminant of [`Event`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnected,
    Error,
    LoginAttempt,
    TokenExpired,
    NetworkError,
    Discarded,
    OfflineQueuePush,
    OfflineQueuePop,
    QueryError,
}

impl Event {
    /// The kind this event dispatches under.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected => EventKind::Connected,
            Event::Disconnected => EventKind::Disconnected,
            Event::Reconnected => EventKind::Reconnected,
            Event::Error { .. } => EventKind::Error,
            Event::LoginAttempt { .. } => EventKind::LoginAttempt,
            Event::TokenExpired => EventKind::TokenExpired,
            Event::NetworkError { .. } => EventKind::NetworkError,
            Event::Discarded { .. } => EventKind::Discarded,
            Event::OfflineQueuePush { .. } => EventKind::OfflineQueuePush,
            Event::OfflineQueuePop { .. } => EventKind::OfflineQueuePop,
            Event::QueryError { .. } => EventKind::QueryError,
        }
    }
}

impl EventKind {
    /// Kinds subject to the emission rate limit.
    fn is_protected(self) -> bool {
        matches!(
            self,
            EventKind::Connected
                | EventKind::Disconnected
                | EventKind::Reconnected
                | EventKind::Error
                | EventKind::LoginAttempt
                | EventKind::TokenExpired
        )
    }
}

/// Handle returned by [`EventEmitter::on`], required to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(Event) + Send + Sync>;

pub(crate) struct EventEmitter {
    event_timeout: Duration,
    inner: Mutex<EmitterInner>,
}

struct EmitterInner {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(u64, Listener)>>,
    last_emitted: HashMap<EventKind, Instant>,
}

impl EventEmitter {
    pub(crate) fn new(event_timeout: Duration) -> Self {
        EventEmitter {
            event_timeout,
            inner: Mutex::new(EmitterInner {
                next_id: 0,
                listeners: HashMap::new(),
                last_emitted: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmitterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a listener for one event kind. Listeners fire in
    /// registration order.
    pub(crate) fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerId(id)
    }

    /// Removes a previously registered listener.
    pub(crate) fn off(&self, kind: EventKind, id: ListenerId) {
        let mut inner = self.lock();
        if let Some(listeners) = inner.listeners.get_mut(&kind) {
            listeners.retain(|(listener_id, _)| *listener_id != id.0);
            if listeners.is_empty() {
                inner.listeners.remove(&kind);
            }
        }
    }

    /// Removes every listener for `kind`, or every listener of every kind
    /// when `kind` is `None`.
    pub(crate) fn remove_all(&self, kind: Option<EventKind>) {
        let mut inner = self.lock();
        match kind {
            Some(kind) => {
                inner.listeners.remove(&kind);
            }
            None => inner.listeners.clear(),
        }
    }

    /// Emits an event to all listeners of its kind.
    ///
    /// Returns false when the event was suppressed by the rate limit.
    pub(crate) fn emit(&self, event: Event) -> bool {
        let kind = event.kind();
        let targets: Vec<Listener> = {
            let mut inner = self.lock();
            if kind.is_protected() {
                let now = Instant::now();
                if let Some(last) = inner.last_emitted.get(&kind) {
                    if now.duration_since(*last) < self.event_timeout {
                        tracing::trace!(?kind, "event suppressed by rate limit");
                        return false;
                    }
                }
                inner.last_emitted.insert(kind, now);
            }
            inner
                .listeners
                .get(&kind)
                .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        for listener in targets {
            let event = event.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { listener(event) });
                }
                // outside a runtime there is nothing to defer to
                Err(_) => listener(event),
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
