// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Subscription bookkeeping.
//!
//! A [`Room`] is one caller-held subscription: a set of filters plus a
//! notification callback. The server assigns it a `roomId` and a delivery
//! `channel` on the first successful renewal; several local rooms matching
//! the same filters share one server-side roomId.
//!
//! The registry tracks rooms in exactly one of two maps at a time:
//! pending (keyed by local id: parked while offline, or renewal in flight)
//! and active (keyed by server roomId). Operations arriving while a renewal
//! is in flight are deferred into the room's own FIFO queue and replayed
//! once the renewal completes.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sg_core::protocol::Notification;
use sg_core::Result;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// Callback receiving realtime notifications for one subscription.
pub(crate) type NotifyFn = Arc<dyn Fn(Notification) + Send + Sync>;

/// Waiter resolved when a renewal completes.
pub(crate) type DoneWaiter = oneshot::Sender<Result<RoomSnapshot>>;

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    /// Waiting for a connection; no renewal in flight.
    Parked,
    /// A renewal request is in flight.
    Pending,
    /// Established server-side.
    Active,
    /// Being torn down.
    Unsubscribing,
}

/// Caller-tunable subscription settings.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    /// Document scope filter (`all`, `in`, `out`, `none`).
    pub scope: Option<String>,
    /// Document state filter (`all`, `pending`, `done`).
    pub state: Option<String>,
    /// User-event filter (`all`, `in`, `out`, `none`).
    pub users: Option<String>,
    /// Deliver notifications caused by this instance's own requests.
    pub subscribe_to_self: bool,
    /// Re-establish after reconnection. `None` inherits the engine setting.
    pub auto_resubscribe: Option<bool>,
    /// Volatile metadata attached to the subscribe request.
    pub volatile: Option<Value>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        RoomOptions {
            scope: None,
            state: None,
            users: None,
            subscribe_to_self: true,
            auto_resubscribe: None,
            volatile: None,
        }
    }
}

/// Operation deferred while a renewal is in flight for the same room.
pub(crate) enum DeferredOp {
    Renew,
    Unsubscribe(Option<oneshot::Sender<Result<()>>>),
    Count(oneshot::Sender<Result<u64>>),
}

pub(crate) struct Room {
    pub id: Uuid,
    pub index: String,
    pub collection: String,
    pub filters: Value,
    pub options: RoomOptions,
    /// Resolved from `options.auto_resubscribe` or the engine default.
    pub auto_resubscribe: bool,
    pub notify: NotifyFn,
    pub room_id: Option<String>,
    pub channel: Option<String>,
    pub last_renewal: Option<Instant>,
    pub status: RoomStatus,
    /// FIFO of operations awaiting the in-flight renewal.
    pub deferred: Vec<DeferredOp>,
    /// Callers awaiting the current establishment.
    pub waiters: Vec<DoneWaiter>,
}

impl Room {
    pub(crate) fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            id: self.id,
            room_id: self.room_id.clone(),
            channel: self.channel.clone(),
            index: self.index.clone(),
            collection: self.collection.clone(),
            filters: self.filters.clone(),
            status: self.status,
        }
    }
}

/// Read-only view of one subscription, for callers and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub id: Uuid,
    pub room_id: Option<String>,
    pub channel: Option<String>,
    pub index: String,
    pub collection: String,
    pub filters: Value,
    pub status: RoomStatus,
}

/// Read-only view of the subscription tables.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionsSnapshot {
    pub active: Vec<RoomSnapshot>,
    pub pending: Vec<RoomSnapshot>,
}

pub(crate) struct SubscriptionRegistry {
    /// Parked and in-flight rooms, keyed by local id.
    pub pending: HashMap<Uuid, Room>,
    /// Established rooms, keyed by server roomId. One entry per occupant.
    pub active: HashMap<String, Vec<Room>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        SubscriptionRegistry {
            pending: HashMap::new(),
            active: HashMap::new(),
        }
    }

    pub(crate) fn get_mut(&mut self, id: Uuid) -> Option<&mut Room> {
        if let Some(room) = self.pending.get_mut(&id) {
            return Some(room);
        }
        self.active
            .values_mut()
            .flat_map(|rooms| rooms.iter_mut())
            .find(|room| room.id == id)
    }

    /// Extracts a room from whichever map holds it, cleaning up an emptied
    /// active slot.
    pub(crate) fn remove(&mut self, id: Uuid) -> Option<Room> {
        if let Some(room) = self.pending.remove(&id) {
            return Some(room);
        }
        let mut found: Option<Room> = None;
        let mut emptied: Option<String> = None;
        for (room_id, rooms) in self.active.iter_mut() {
            if let Some(pos) = rooms.iter().position(|room| room.id == id) {
                found = Some(rooms.remove(pos));
                if rooms.is_empty() {
                    emptied = Some(room_id.clone());
                }
                break;
            }
        }
        if let Some(room_id) = emptied {
            self.active.remove(&room_id);
        }
        found
    }

    /// Puts a room back into the map matching its status. Used to restore
    /// a room extracted with [`Self::remove`] when an operation bails out.
    pub(crate) fn restore(&mut self, room: Room) {
        if room.status == RoomStatus::Active {
            if let Some(room_id) = room.room_id.clone() {
                self.active.entry(room_id).or_default().push(room);
                return;
            }
        }
        self.pending.insert(room.id, room);
    }

    pub(crate) fn has_active_room(&self, room_id: &str) -> bool {
        self.active
            .get(room_id)
            .is_some_and(|rooms| !rooms.is_empty())
    }

    /// True while any subscription has a renewal request in flight.
    /// Parked rooms (waiting for a connection) do not count.
    pub(crate) fn renewal_in_flight(&self) -> bool {
        self.pending
            .values()
            .any(|room| room.status == RoomStatus::Pending)
    }

    /// Occupants listening on a delivery channel:
    /// `(room local id, callback, subscribe_to_self)`.
    pub(crate) fn occupants(&self, channel: &str) -> Vec<(Uuid, NotifyFn, bool)> {
        self.active
            .values()
            .flat_map(|rooms| rooms.iter())
            .filter(|room| room.channel.as_deref() == Some(channel))
            .map(|room| {
                (
                    room.id,
                    Arc::clone(&room.notify),
                    room.options.subscribe_to_self,
                )
            })
            .collect()
    }

    /// Detaches every active room from its server-side registration.
    /// Rooms with `auto_resubscribe` are parked for re-establishment; the
    /// rest are dropped (their waiters observe the cancellation).
    pub(crate) fn park_active(&mut self) {
        let drained: Vec<Room> = self
            .active
            .drain()
            .flat_map(|(_, rooms)| rooms)
            .collect();
        for mut room in drained {
            if room.auto_resubscribe {
                room.room_id = None;
                room.channel = None;
                room.status = RoomStatus::Parked;
                self.pending.insert(room.id, room);
            } else {
                tracing::debug!(room = %room.id, "dropping non-resubscribing room");
            }
        }
    }

    /// Drops every room. Used on engine shutdown.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.active.clear();
    }

    pub(crate) fn snapshot(&self) -> SubscriptionsSnapshot {
        SubscriptionsSnapshot {
            active: self
                .active
                .values()
                .flat_map(|rooms| rooms.iter())
                .map(Room::snapshot)
                .collect(),
            pending: self.pending.values().map(Room::snapshot).collect(),
        }
    }
}

#[cfg(test)]
#[path = "room_tests.rs"]
mod tests;
