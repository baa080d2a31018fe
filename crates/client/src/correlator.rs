// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Request/response correlation.
//!
//! Every sent request that expects an answer registers a one-shot
//! completion keyed by its request id *before* the payload reaches the
//! transport, so a fast response cannot race the registration. The first
//! matching response consumes the completion; duplicates find nothing and
//! are ignored, which is what gives the at-most-once delivery guarantee.
//!
//! The correlator also keeps a short-lived history of sent request ids so
//! the subscription layer can recognize notifications that are echoes of
//! this instance's own writes.

use std::collections::HashMap;

use sg_core::protocol::{Response, ResponseError};
use sg_core::{Error, Result};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// One-shot channel resolving a request with its response or error.
pub(crate) type Completion = oneshot::Sender<Result<Response>>;

struct PendingCompletion {
    /// Action of the originating request; token-expiry classification
    /// must not trigger for logout responses.
    action: String,
    sender: Option<Completion>,
}

/// How a resolved response should be surfaced by the engine, beyond the
/// completion itself.
#[derive(Debug, Default)]
pub(crate) struct Disposition {
    pub token_expired: bool,
    pub error: Option<ResponseError>,
}

pub(crate) struct RequestCorrelator {
    pending: HashMap<String, PendingCompletion>,
    history: HashMap<String, Instant>,
}

impl RequestCorrelator {
    pub(crate) fn new() -> Self {
        RequestCorrelator {
            pending: HashMap::new(),
            history: HashMap::new(),
        }
    }

    /// Registers the completion for a request about to be sent. `sender`
    /// may be `None` when the caller only needs error classification
    /// (fire-and-forget requests under an auth token).
    pub(crate) fn register(&mut self, request_id: &str, action: &str, sender: Option<Completion>) {
        self.pending.insert(
            request_id.to_string(),
            PendingCompletion {
                action: action.to_string(),
                sender,
            },
        );
    }

    pub(crate) fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Records a sent request id in the echo-detection history.
    pub(crate) fn record_history(&mut self, request_id: &str) {
        self.history.insert(request_id.to_string(), Instant::now());
    }

    /// True when the id belongs to a request this instance sent recently.
    /// A match is consumed.
    pub(crate) fn consume_own(&mut self, request_id: &str) -> bool {
        self.history.remove(request_id).is_some()
    }

    /// Drops history entries older than `ttl`.
    pub(crate) fn sweep_history(&mut self, now: Instant, ttl: Duration) {
        self.history
            .retain(|_, sent_at| now.duration_since(*sent_at) < ttl);
    }

    /// Resolves the completion matching `request_id`, classifying any
    /// server-side error. Returns `None` for unknown ids (stale or
    /// duplicate responses).
    pub(crate) fn resolve(&mut self, request_id: &str, response: Response) -> Option<Disposition> {
        let pending = self.pending.remove(request_id)?;

        let mut disposition = Disposition::default();
        if let Some(err) = &response.error {
            if pending.action != "logout" && err.message == "Token expired" {
                disposition.token_expired = true;
            }
            disposition.error = Some(err.clone());
        }

        if let Some(sender) = pending.sender {
            let outcome = match &response.error {
                Some(err) => Err(Error::Api {
                    message: err.message.clone(),
                    status: err.status.or(response.status).unwrap_or(500),
                    stack: err.stack.clone(),
                }),
                None => Ok(response),
            };
            // receiver may be gone, e.g. the caller dropped its future
            let _ = sender.send(outcome);
        }

        Some(disposition)
    }

    /// Cancels every outstanding completion. Used on engine shutdown;
    /// waiters observe the cancellation through their dropped senders.
    pub(crate) fn cancel_all(&mut self) {
        self.pending.clear();
        self.history.clear();
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[path = "correlator_tests.rs"]
mod tests;
