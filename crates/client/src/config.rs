// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration.

use std::time::Duration;

use serde_json::{Map, Value};

/// Shorthand for the offline queue/replay posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineMode {
    /// Queuing and replay are driven by the individual flags.
    Manual,
    /// Enables both `auto_queue` and `auto_replay`.
    Auto,
}

/// Tunables of one engine instance, fixed at construction.
///
/// The queuing posture (`auto_queue`/`auto_replay`) and the queue filter and
/// loader hooks remain adjustable at runtime through the engine itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Start queuing automatically while offline.
    pub auto_queue: bool,
    /// Replay the queue automatically on (re)connection.
    pub auto_replay: bool,
    /// Re-establish subscriptions automatically on reconnection.
    pub auto_resubscribe: bool,
    /// When `Auto`, forces `auto_queue` and `auto_replay` on.
    pub offline_mode: OfflineMode,
    /// Maximum age of a queued request. Zero keeps entries forever.
    pub queue_ttl: Duration,
    /// Maximum number of queued requests. Zero means unbounded.
    pub queue_max_size: usize,
    /// Spacing between replayed requests.
    pub replay_interval: Duration,
    /// Suppression window for connection-lifecycle events.
    pub event_timeout: Duration,
    /// Minimum spacing between renewals of one subscription.
    pub renewal_delay: Duration,
    /// Throttle window for token-expiration handling.
    pub token_expired_interval: Duration,
    /// Volatile metadata merged into every outgoing request.
    pub volatile: Map<String, Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            auto_queue: false,
            auto_replay: false,
            auto_resubscribe: true,
            offline_mode: OfflineMode::Manual,
            queue_ttl: Duration::from_secs(120),
            queue_max_size: 500,
            replay_interval: Duration::from_millis(10),
            event_timeout: Duration::from_millis(200),
            renewal_delay: Duration::from_millis(500),
            token_expired_interval: Duration::from_secs(1),
            volatile: Map::new(),
        }
    }
}

impl EngineConfig {
    /// Resolves the offline-mode shorthand into the individual flags.
    pub(crate) fn normalized(mut self) -> Self {
        if self.offline_mode == OfflineMode::Auto {
            self.auto_queue = true;
            self.auto_replay = true;
        }
        self
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
