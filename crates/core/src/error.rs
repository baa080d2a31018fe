// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for sg-core and the surge engine.

use thiserror::Error;

/// All possible errors surfaced by the surge engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine instance reached its terminal state and must be discarded.
    #[error("this client instance has been invalidated\n  hint: a new engine must be created after disconnect()")]
    InvalidatedInstance,

    /// A request could not be sent and was not eligible for queuing.
    #[error("unable to execute request: not connected to the server\n  discarded request: {request}")]
    Discarded {
        /// Serialized form of the offending request, for debuggability.
        request: String,
    },

    /// Invalid engine configuration. Fatal, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// An entry produced by the offline queue loader is missing required
    /// attributes (requestId, action, controller).
    #[error("invalid offline queue entry: one or more missing properties: requestId, action, controller")]
    InvalidQueueEntry,

    /// The server answered the request with an error.
    #[error("api error [{status}]: {message}")]
    Api {
        message: String,
        status: i64,
        stack: Option<String>,
    },

    /// A subscription renewal was attempted too soon after the previous one.
    #[error("subscription already renewed less than {0}ms ago")]
    RenewedTooRecently(u64),

    /// A subscription could not be established.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// The operation targets a room with no active server-side registration.
    #[error("cannot perform this operation on an inactive room")]
    InactiveRoom,

    /// The completion was dropped before a response arrived, e.g. because
    /// the entry was evicted from the offline queue or the engine shut down.
    #[error("request canceled before a response arrived")]
    Canceled,

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Builds the discarded-request error for a request, embedding its
    /// serialized form so logs identify the offender.
    pub fn discarded<T: serde::Serialize>(request: &T) -> Self {
        let request = serde_json::to_string(request)
            .unwrap_or_else(|_| "<unserializable request>".to_string());
        Error::Discarded { request }
    }
}

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
