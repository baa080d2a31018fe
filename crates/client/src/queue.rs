// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Offline queue buffering requests while the engine cannot send.
//!
//! The queue is a plain FIFO with two eviction rules applied before every
//! enqueue and before every replay pass:
//!
//! 1. TTL: the queue is time-ordered by insertion, so one stale entry makes
//!    everything older than it stale too. The whole head range up to and
//!    including the newest stale entry is evicted in one pass.
//! 2. Size: when a maximum size is set, the oldest entries are evicted
//!    until the queue fits.
//!
//! Entries loaded from an external source can be merged in front of the
//! resident entries; on a request-id collision the loaded copy wins.

use std::collections::{HashSet, VecDeque};

use sg_core::protocol::Request;
use sg_core::{Error, Result};
use tokio::time::{Duration, Instant};

use crate::correlator::Completion;

/// One buffered request, owned exclusively by the queue until replayed or
/// evicted. Dropping an entry cancels its completion.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub queued_at: Instant,
    pub request: Request,
    pub completion: Option<Completion>,
}

pub(crate) struct OfflineQueue {
    /// Zero means entries are kept forever.
    ttl: Duration,
    /// Zero means the queue is unbounded.
    max_size: usize,
    entries: VecDeque<QueuedRequest>,
}

impl OfflineQueue {
    pub(crate) fn new(ttl: Duration, max_size: usize) -> Self {
        OfflineQueue {
            ttl,
            max_size,
            entries: VecDeque::new(),
        }
    }

    /// Appends a request, stamped with the current time.
    pub(crate) fn push(&mut self, request: Request, completion: Option<Completion>) {
        self.entries.push_back(QueuedRequest {
            queued_at: Instant::now(),
            request,
            completion,
        });
    }

    /// Applies TTL and size eviction, returning the evicted entries in
    /// queue order so the caller can fire one pop event per entry.
    pub(crate) fn clean(&mut self, now: Instant) -> Vec<QueuedRequest> {
        let mut evicted = Vec::new();

        if self.ttl > Duration::ZERO {
            if let Some(cutoff) = now.checked_sub(self.ttl) {
                let last_stale = self
                    .entries
                    .iter()
                    .rposition(|entry| entry.queued_at < cutoff);
                if let Some(index) = last_stale {
                    evicted.extend(self.entries.drain(..=index));
                }
            }
        }

        if self.max_size > 0 {
            while self.entries.len() > self.max_size {
                if let Some(entry) = self.entries.pop_front() {
                    evicted.push(entry);
                }
            }
        }

        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted stale offline queue entries");
        }
        evicted
    }

    /// Merges externally loaded requests in front of the resident entries,
    /// dropping duplicates by request id (first occurrence wins, so loaded
    /// entries take priority over resident ones).
    ///
    /// Malformed entries are a fatal configuration error: continuing would
    /// silently lose requests.
    pub(crate) fn merge_loaded(&mut self, loaded: Vec<Request>) -> Result<()> {
        for request in loaded.iter().chain(self.entries.iter().map(|e| &e.request)) {
            if request.request_id.is_empty()
                || request.action.is_empty()
                || request.controller.is_empty()
            {
                return Err(Error::InvalidQueueEntry);
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut merged = VecDeque::with_capacity(loaded.len() + self.entries.len());
        let now = Instant::now();
        for request in loaded {
            if seen.insert(request.request_id.clone()) {
                merged.push_back(QueuedRequest {
                    queued_at: now,
                    request,
                    completion: None,
                });
            }
        }
        for entry in self.entries.drain(..) {
            if seen.insert(entry.request.request_id.clone()) {
                merged.push_back(entry);
            }
        }
        self.entries = merged;
        Ok(())
    }

    pub(crate) fn pop_front(&mut self) -> Option<QueuedRequest> {
        self.entries.pop_front()
    }

    /// Drops every entry without replaying. Pending completions are
    /// canceled by the drop.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only view of the buffered requests, for diagnostics.
    pub(crate) fn snapshot(&self) -> Vec<Request> {
        self.entries.iter().map(|e| e.request.clone()).collect()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
