// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The engine facade and its state machine.
//!
//! One [`Engine`] owns one logical session with the remote service. All
//! mutable state (connection state, offline queue, correlator, subscription
//! tables) lives behind a single mutex; transport events are consumed by a
//! single dispatcher task, so transport callbacks and caller-driven calls
//! are serialized against each other.
//!
//! Public operations never block the caller: results are delivered through
//! futures, and the only delays are timers (replay pacing, the renewal
//! debounce window, the unsubscribe poll).

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{json, Value};
use sg_core::protocol::{Notification, Request, RequestArgs, Response};
use sg_core::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::correlator::{Completion, RequestCorrelator};
use crate::events::{Event, EventEmitter, EventKind, ListenerId};
use crate::queue::OfflineQueue;
use crate::room::{
    DeferredOp, NotifyFn, Room, RoomOptions, RoomSnapshot, RoomStatus, SubscriptionRegistry,
    SubscriptionsSnapshot,
};
use crate::state::ConnectionState;
use crate::transport::{Transport, TransportEvent};

const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sent request ids are remembered this long for echo detection.
const HISTORY_TTL: Duration = Duration::from_secs(10);
const HISTORY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Interval of the deferred room-teardown poll.
const UNSUBSCRIBE_POLL_INTERVAL: Duration = Duration::from_millis(100);

type QueueFilter = Box<dyn Fn(&Request) -> bool + Send + Sync>;
type QueueLoader = Box<dyn Fn() -> Vec<Request> + Send + Sync>;

/// Per-call options for [`Engine::query`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Allow buffering this request while the engine cannot send. When
    /// false, an unsendable request fails immediately instead.
    pub queuable: bool,
    /// Volatile metadata for this request, merged over the engine's own.
    pub volatile: Option<Value>,
    /// Ask the server to wait for indexation before answering.
    pub refresh: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            queuable: true,
            volatile: None,
            refresh: false,
        }
    }
}

/// Client engine for a realtime data service.
///
/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Handle on one subscription, returned by [`Engine::subscribe`].
#[derive(Clone)]
pub struct RoomHandle {
    inner: Arc<EngineInner>,
    id: Uuid,
}

struct EngineInner {
    config: EngineConfig,
    /// Stamped into every request's volatile metadata.
    instance_id: String,
    emitter: EventEmitter,
    transport: Box<dyn Transport>,
    state: Mutex<EngineState>,
    /// Taken by the dispatcher task on first connect.
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

struct EngineState {
    connection: ConnectionState,
    queuing: bool,
    replaying: bool,
    tasks_started: bool,
    auto_queue: bool,
    auto_replay: bool,
    auto_resubscribe: bool,
    token: Option<String>,
    last_token_expired: Option<Instant>,
    queue: OfflineQueue,
    correlator: RequestCorrelator,
    rooms: SubscriptionRegistry,
    queue_filter: Option<QueueFilter>,
    queue_loader: Option<QueueLoader>,
}

impl Engine {
    /// Creates an engine over a transport and the event channel produced
    /// alongside it.
    pub fn new<T: Transport>(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: EngineConfig,
    ) -> Self {
        let config = config.normalized();
        let state = EngineState {
            connection: ConnectionState::Initializing,
            queuing: false,
            replaying: false,
            tasks_started: false,
            auto_queue: config.auto_queue,
            auto_replay: config.auto_replay,
            auto_resubscribe: config.auto_resubscribe,
            token: None,
            last_token_expired: None,
            queue: OfflineQueue::new(config.queue_ttl, config.queue_max_size),
            correlator: RequestCorrelator::new(),
            rooms: SubscriptionRegistry::new(),
            queue_filter: None,
            queue_loader: None,
        };
        Engine {
            inner: Arc::new(EngineInner {
                instance_id: Uuid::new_v4().to_string(),
                emitter: EventEmitter::new(config.event_timeout),
                transport: Box::new(transport),
                state: Mutex::new(state),
                events_rx: Mutex::new(Some(events)),
                config,
            }),
        }
    }

    /// Initiates the connection. Resolves once the transport attempt
    /// completes; the post-connect sequence (subscription renewal, queue
    /// replay) runs from the dispatcher afterwards.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut st = self.inner.lock();
            if st.connection.is_terminal() {
                return Err(Error::InvalidatedInstance);
            }
            if st.connection.is_open() {
                return Ok(());
            }
            st.connection = ConnectionState::Connecting;
            if st.auto_queue {
                st.queuing = true;
            }
            if !st.tasks_started {
                st.tasks_started = true;
                let events = self
                    .inner
                    .events_rx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(events) = events {
                    tokio::spawn(dispatch_events(Arc::clone(&self.inner), events));
                }
                tokio::spawn(sweep_history_task(Arc::downgrade(&self.inner)));
            }
        }
        match self.inner.transport.connect().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut st = self.inner.lock();
                if !st.connection.is_terminal() {
                    st.connection = ConnectionState::Error;
                }
                Err(err.into())
            }
        }
    }

    /// Disconnects and invalidates this instance: the offline queue is
    /// discarded without replay, pending subscriptions are abandoned and
    /// every further API call fails fast.
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    /// True while requests can be handed to the transport.
    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// Current auth token.
    pub fn token(&self) -> Option<String> {
        self.inner.lock().token.clone()
    }

    /// Replaces the auth token used for subsequent requests.
    pub fn set_token(&self, token: Option<String>) {
        self.inner.lock().token = token;
    }

    /// True while new requests are being buffered instead of sent.
    pub fn queuing(&self) -> bool {
        self.inner.lock().queuing
    }

    /// Starts buffering requests, regardless of the `auto_queue` setting.
    pub fn start_queuing(&self) -> Result<()> {
        let mut st = self.inner.lock();
        if st.connection.is_terminal() {
            return Err(Error::InvalidatedInstance);
        }
        st.queuing = true;
        Ok(())
    }

    /// Stops buffering requests.
    pub fn stop_queuing(&self) -> Result<()> {
        let mut st = self.inner.lock();
        if st.connection.is_terminal() {
            return Err(Error::InvalidatedInstance);
        }
        st.queuing = false;
        Ok(())
    }

    /// Empties the offline queue without replaying it. Buffered callers
    /// observe a cancellation.
    pub fn flush_queue(&self) -> Result<()> {
        let mut st = self.inner.lock();
        if st.connection.is_terminal() {
            return Err(Error::InvalidatedInstance);
        }
        st.queue.clear();
        Ok(())
    }

    /// Replays the buffered requests now, when connected. Fails on an
    /// invalid offline-queue-loader configuration.
    pub fn play_queue(&self) -> Result<()> {
        let mut st = self.inner.lock();
        if st.connection.is_terminal() {
            return Err(Error::InvalidatedInstance);
        }
        if st.connection.is_open() {
            self.inner.start_replay(&mut st)?;
        }
        Ok(())
    }

    /// Read-only view of the buffered requests.
    pub fn offline_queue(&self) -> Vec<Request> {
        self.inner.lock().queue.snapshot()
    }

    /// Read-only view of the subscription tables.
    pub fn subscriptions(&self) -> SubscriptionsSnapshot {
        self.inner.lock().rooms.snapshot()
    }

    /// Installs a predicate consulted before queuing any request; when it
    /// returns false the request is treated as non-queuable.
    pub fn set_queue_filter<F>(&self, filter: F)
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.inner.lock().queue_filter = Some(Box::new(filter));
    }

    /// Removes the queue filter.
    pub fn clear_queue_filter(&self) {
        self.inner.lock().queue_filter = None;
    }

    /// Installs a loader merged into the queue before every replay pass.
    /// Loaded entries are replayed first; on a request-id collision the
    /// loaded copy wins.
    pub fn set_offline_queue_loader<F>(&self, loader: F)
    where
        F: Fn() -> Vec<Request> + Send + Sync + 'static,
    {
        self.inner.lock().queue_loader = Some(Box::new(loader));
    }

    /// Removes the offline queue loader.
    pub fn clear_offline_queue_loader(&self) {
        self.inner.lock().queue_loader = None;
    }

    /// Registers a listener for one event kind.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.inner.emitter.on(kind, listener)
    }

    /// Removes a previously registered listener.
    pub fn off(&self, kind: EventKind, id: ListenerId) {
        self.inner.emitter.off(kind, id);
    }

    /// Removes every listener for `kind`, or all listeners when `None`.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        self.inner.emitter.remove_all(kind);
    }

    /// Reports the outcome of an authentication attempt performed by an
    /// auth helper. On success, parked subscriptions are re-established.
    pub fn report_login_attempt(&self, success: bool) {
        self.inner.emitter.emit(Event::LoginAttempt { success });
        if success && self.inner.lock().connection.is_open() {
            self.inner.renew_parked();
        }
    }

    /// Sends one request, or buffers it while offline.
    ///
    /// The request is issued (sent, queued or discarded) before the
    /// returned future is first polled. There is no per-request timeout: a
    /// response that never arrives resolves the future only when the
    /// engine shuts down.
    pub fn query(
        &self,
        args: RequestArgs,
        body: Option<Value>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<Response>> + Send + 'static {
        let issued = self.inner.issue(args, body, options);
        async move {
            match issued {
                Ok(rx) => match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Canceled),
                },
                Err(err) => Err(err),
            }
        }
    }

    /// Registers a subscription and starts establishing it. While
    /// disconnected the subscription is parked and established
    /// automatically once the connection is up.
    pub fn subscribe<F>(
        &self,
        index: impl Into<String>,
        collection: impl Into<String>,
        filters: Value,
        options: RoomOptions,
        notify: F,
    ) -> Result<RoomHandle>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        {
            let mut st = self.inner.lock();
            if st.connection.is_terminal() {
                return Err(Error::InvalidatedInstance);
            }
            let auto_resubscribe = options.auto_resubscribe.unwrap_or(st.auto_resubscribe);
            let room = Room {
                id,
                index: index.into(),
                collection: collection.into(),
                filters,
                options,
                auto_resubscribe,
                notify: Arc::new(notify),
                room_id: None,
                channel: None,
                last_renewal: None,
                status: RoomStatus::Parked,
                deferred: Vec::new(),
                waiters: Vec::new(),
            };
            st.rooms.pending.insert(id, room);
            tracing::debug!(room = %id, "subscription registered");
        }
        self.inner.renew_room(id);
        Ok(RoomHandle {
            inner: Arc::clone(&self.inner),
            id,
        })
    }
}

impl RoomHandle {
    /// Local id of this subscription.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Server-assigned room id, once established.
    pub fn room_id(&self) -> Option<String> {
        let mut st = self.inner.lock();
        st.rooms.get_mut(self.id).and_then(|room| room.room_id.clone())
    }

    /// Read-only view of this subscription, while it exists.
    pub fn snapshot(&self) -> Option<RoomSnapshot> {
        let mut st = self.inner.lock();
        st.rooms.get_mut(self.id).map(|room| room.snapshot())
    }

    /// Resolves once the current establishment completes. Returns
    /// immediately when the subscription is already active.
    pub async fn wait_established(&self) -> Result<RoomSnapshot> {
        let rx = {
            let mut st = self.inner.lock();
            if st.connection.is_terminal() {
                return Err(Error::InvalidatedInstance);
            }
            let Some(room) = st.rooms.get_mut(self.id) else {
                return Err(Error::InactiveRoom);
            };
            if room.status == RoomStatus::Active {
                return Ok(room.snapshot());
            }
            let (tx, rx) = oneshot::channel();
            room.waiters.push(tx);
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Canceled),
        }
    }

    /// Re-establishes the subscription, optionally with new filters.
    /// Rejected when a renewal completed less than the configured renewal
    /// delay ago.
    pub async fn renew(&self, filters: Option<Value>) -> Result<RoomSnapshot> {
        let rx = {
            let mut st = self.inner.lock();
            if st.connection.is_terminal() {
                return Err(Error::InvalidatedInstance);
            }
            let Some(room) = st.rooms.get_mut(self.id) else {
                return Err(Error::InactiveRoom);
            };
            if let Some(filters) = filters {
                room.filters = filters;
            }
            let (tx, rx) = oneshot::channel();
            room.waiters.push(tx);
            rx
        };
        self.inner.renew_room(self.id);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Canceled),
        }
    }

    /// Stops this subscription. Notification delivery stops immediately;
    /// the server-side room is torn down once its last local occupant is
    /// gone and no renewal is in flight.
    pub async fn unsubscribe(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.unsubscribe_room(self.id, Some(tx));
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Canceled),
        }
    }

    /// Asks the server how many subscriptions share this room.
    pub async fn count(&self) -> Result<u64> {
        Arc::clone(&self.inner).count_room(self.id).await
    }
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills in the engine-level request fields: default volatile
    /// metadata, instance stamp and auth token.
    fn decorate(&self, st: &mut EngineState, request: &mut Request) {
        request.merge_volatile(&self.config.volatile);
        request.set_volatile("sdkInstanceId", Value::String(self.instance_id.clone()));
        request.set_volatile("sdkVersion", Value::String(SDK_VERSION.to_string()));
        if request.jwt.is_none() {
            request.jwt = st.token.clone();
        }
    }

    /// Registers the completion and hands the request to the transport.
    /// Registration happens first so a fast response cannot race it.
    fn send_request(&self, st: &mut EngineState, request: Request, completion: Option<Completion>) {
        if completion.is_some() || request.jwt.is_some() {
            st.correlator
                .register(&request.request_id, &request.action, completion);
        }
        st.correlator.record_history(&request.request_id);
        self.transport.send(&request);
    }

    fn clean_queue(&self, st: &mut EngineState) {
        for entry in st.queue.clean(Instant::now()) {
            self.emitter.emit(Event::OfflineQueuePop {
                request: entry.request,
            });
        }
    }

    /// The four-way sending policy: send when connected, fail when not
    /// queuable, queue while the queuing posture is active (explicitly
    /// started, auto while offline, or the startup states), fail otherwise.
    fn issue(
        &self,
        args: RequestArgs,
        body: Option<Value>,
        options: QueryOptions,
    ) -> Result<oneshot::Receiver<Result<Response>>> {
        let mut st = self.lock();
        if st.connection.is_terminal() {
            return Err(Error::InvalidatedInstance);
        }

        let mut request = Request::new(Uuid::new_v4().to_string(), args, body);
        if options.refresh {
            request.refresh = Some("wait_for".to_string());
        }
        if let Some(volatile) = options.volatile {
            request.volatile = Some(volatile);
        }
        self.decorate(&mut st, &mut request);

        let mut queuable = options.queuable;
        if let Some(filter) = &st.queue_filter {
            queuable = queuable && filter(&request);
        }

        let (tx, rx) = oneshot::channel();
        if st.connection.is_open() {
            self.send_request(&mut st, request, Some(tx));
        } else if !queuable {
            self.emitter.emit(Event::Discarded {
                request: request.clone(),
            });
            let _ = tx.send(Err(Error::discarded(&request)));
        } else if st.queuing
            || st.connection.is_transitional()
            || (st.auto_queue && st.connection == ConnectionState::Offline)
        {
            self.clean_queue(&mut st);
            self.emitter.emit(Event::OfflineQueuePush {
                request: request.clone(),
            });
            st.queue.push(request, Some(tx));
            tracing::debug!(queued = st.queue.len(), "request buffered while offline");
        } else {
            self.emitter.emit(Event::Discarded {
                request: request.clone(),
            });
            let _ = tx.send(Err(Error::discarded(&request)));
        }
        Ok(rx)
    }

    /// Merges the loader output and starts the paced replay task.
    fn start_replay(self: &Arc<Self>, st: &mut EngineState) -> Result<()> {
        self.clean_queue(st);
        if let Some(loader) = &st.queue_loader {
            let loaded = loader();
            st.queue.merge_loaded(loaded)?;
        }
        if st.queue.is_empty() {
            st.queuing = false;
            return Ok(());
        }
        if st.replaying {
            return Ok(());
        }
        st.replaying = true;
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.replay_loop().await });
        Ok(())
    }

    /// Replays the queue strictly FIFO, one request per tick.
    async fn replay_loop(self: Arc<Self>) {
        loop {
            {
                let mut st = self.lock();
                if !st.connection.is_open() {
                    st.replaying = false;
                    return;
                }
                let Some(entry) = st.queue.pop_front() else {
                    st.replaying = false;
                    // backlog drained, stop buffering new requests
                    st.queuing = false;
                    return;
                };
                self.emitter.emit(Event::OfflineQueuePop {
                    request: entry.request.clone(),
                });
                self.send_request(&mut st, entry.request, entry.completion);
            }
            tokio::time::sleep(self.config.replay_interval).await;
        }
    }

    fn renew_parked(self: &Arc<Self>) {
        let ids: Vec<Uuid> = {
            let st = self.lock();
            st.rooms.pending.keys().copied().collect()
        };
        for id in ids {
            self.renew_room(id);
        }
    }

    /// One renewal pass for one subscription: debounce, park while
    /// offline, defer behind an in-flight renewal, or send the subscribe
    /// request and hand the continuation to a completion task.
    fn renew_room(self: &Arc<Self>, id: Uuid) {
        let mut teardown: Option<String> = None;
        let rx = {
            let mut st = self.lock();
            if st.connection.is_terminal() {
                return;
            }
            let connection = st.connection;
            let Some(mut room) = st.rooms.remove(id) else {
                return;
            };

            // debounce: collapses renewal storms from flapping connections
            let now = Instant::now();
            if let Some(last) = room.last_renewal {
                if now.duration_since(last) <= self.config.renewal_delay {
                    let delay_ms = self.config.renewal_delay.as_millis() as u64;
                    for waiter in room.waiters.drain(..) {
                        let _ = waiter.send(Err(Error::RenewedTooRecently(delay_ms)));
                    }
                    st.rooms.restore(room);
                    return;
                }
            }

            if room.status == RoomStatus::Pending {
                room.deferred.push(DeferredOp::Renew);
                st.rooms.restore(room);
                return;
            }

            if !connection.is_open() {
                room.status = RoomStatus::Parked;
                room.room_id = None;
                room.channel = None;
                st.rooms.pending.insert(room.id, room);
                return;
            }

            // drop any prior server-side registration before re-subscribing
            if let Some(old_room_id) = room.room_id.take() {
                room.channel = None;
                teardown = Some(old_room_id);
            }

            room.status = RoomStatus::Pending;
            let mut request = Request::new(
                Uuid::new_v4().to_string(),
                RequestArgs::scoped(
                    "realtime",
                    "subscribe",
                    room.index.clone(),
                    room.collection.clone(),
                ),
                Some(room.filters.clone()),
            );
            request.scope = room.options.scope.clone();
            request.state = room.options.state.clone();
            request.users = room.options.users.clone();
            if let Some(volatile) = &room.options.volatile {
                request.volatile = Some(volatile.clone());
            }
            self.decorate(&mut st, &mut request);

            let (tx, rx) = oneshot::channel();
            st.rooms.pending.insert(room.id, room);
            self.send_request(&mut st, request, Some(tx));
            rx
        };

        if let Some(old_room_id) = teardown {
            self.maybe_teardown(old_room_id);
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Canceled),
            };
            inner.finish_renewal(id, outcome);
        });
    }

    /// Adopts the server-assigned room on success and drains the room's
    /// deferred operations; on failure the deferred queue is dropped.
    fn finish_renewal(self: &Arc<Self>, id: Uuid, outcome: Result<Response>) {
        let deferred = {
            let mut st = self.lock();
            let Some(mut room) = st.rooms.remove(id) else {
                return;
            };
            let established = outcome.and_then(|response| {
                response.subscription().ok_or_else(|| {
                    Error::Subscription("subscribe response missing roomId/channel".to_string())
                })
            });
            match established {
                Ok((room_id, channel)) => {
                    tracing::debug!(room = %room.id, server_room = %room_id, "subscription established");
                    room.last_renewal = Some(Instant::now());
                    room.room_id = Some(room_id.clone());
                    room.channel = Some(channel);
                    room.status = RoomStatus::Active;
                    let deferred = std::mem::take(&mut room.deferred);
                    let snapshot = room.snapshot();
                    for waiter in room.waiters.drain(..) {
                        let _ = waiter.send(Ok(snapshot.clone()));
                    }
                    st.rooms.active.entry(room_id).or_default().push(room);
                    deferred
                }
                Err(err) => {
                    tracing::warn!(room = %room.id, "subscription renewal failed: {err}");
                    // operations queued behind a failed renewal are dropped
                    for op in room.deferred.drain(..) {
                        match op {
                            DeferredOp::Renew => {}
                            DeferredOp::Unsubscribe(waiter) => {
                                if let Some(waiter) = waiter {
                                    let _ = waiter.send(Ok(()));
                                }
                            }
                            DeferredOp::Count(waiter) => {
                                let _ = waiter.send(Err(Error::Subscription(err.to_string())));
                            }
                        }
                    }
                    for waiter in room.waiters.drain(..) {
                        let _ = waiter.send(Err(Error::Subscription(err.to_string())));
                    }
                    room.status = RoomStatus::Parked;
                    room.room_id = None;
                    room.channel = None;
                    st.rooms.pending.insert(room.id, room);
                    Vec::new()
                }
            }
        };
        for op in deferred {
            self.run_deferred(id, op);
        }
    }

    fn run_deferred(self: &Arc<Self>, id: Uuid, op: DeferredOp) {
        match op {
            DeferredOp::Renew => self.renew_room(id),
            DeferredOp::Unsubscribe(waiter) => self.unsubscribe_room(id, waiter),
            DeferredOp::Count(waiter) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let result = inner.count_room(id).await;
                    let _ = waiter.send(result);
                });
            }
        }
    }

    fn unsubscribe_room(self: &Arc<Self>, id: Uuid, waiter: Option<oneshot::Sender<Result<()>>>) {
        let teardown = {
            let mut st = self.lock();
            if st.connection.is_terminal() {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(Error::InvalidatedInstance));
                }
                return;
            }
            // defer while a renewal is in flight for this room
            if let Some(room) = st.rooms.get_mut(id) {
                if room.status == RoomStatus::Pending {
                    room.deferred.push(DeferredOp::Unsubscribe(waiter));
                    return;
                }
            }
            let Some(mut room) = st.rooms.remove(id) else {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                return;
            };
            room.status = RoomStatus::Unsubscribing;
            // dropping the room detaches its listener immediately
            room.room_id.take()
        };
        if let Some(room_id) = teardown {
            self.maybe_teardown(room_id);
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Sends the server-side teardown for a room nobody occupies anymore.
    /// While some subscription is mid-renewal the teardown is deferred and
    /// polled, in case that renewal re-occupies the same room.
    fn maybe_teardown(self: &Arc<Self>, room_id: String) {
        let mut st = self.lock();
        if st.connection.is_terminal() {
            return;
        }
        if st.rooms.has_active_room(&room_id) {
            return; // other occupants remain
        }
        if !st.rooms.renewal_in_flight() {
            self.send_teardown(&mut st, &room_id);
            return;
        }
        drop(st);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(UNSUBSCRIBE_POLL_INTERVAL);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let mut st = inner.lock();
                if st.connection.is_terminal() {
                    return;
                }
                if st.rooms.has_active_room(&room_id) {
                    return; // re-occupied in the meantime
                }
                if !st.rooms.renewal_in_flight() {
                    inner.send_teardown(&mut st, &room_id);
                    return;
                }
            }
        });
    }

    fn send_teardown(&self, st: &mut EngineState, room_id: &str) {
        tracing::debug!(%room_id, "tearing down server-side room");
        let mut request = Request::new(
            Uuid::new_v4().to_string(),
            RequestArgs::new("realtime", "unsubscribe"),
            Some(json!({ "roomId": room_id })),
        );
        self.decorate(st, &mut request);
        self.send_request(st, request, None);
    }

    async fn count_room(self: Arc<Self>, id: Uuid) -> Result<u64> {
        enum Wait {
            Immediate(oneshot::Receiver<Result<Response>>),
            Deferred(oneshot::Receiver<Result<u64>>),
        }
        let wait = {
            let mut st = self.lock();
            if st.connection.is_terminal() {
                return Err(Error::InvalidatedInstance);
            }
            let Some(room) = st.rooms.get_mut(id) else {
                return Err(Error::InactiveRoom);
            };
            if room.status == RoomStatus::Pending {
                let (tx, rx) = oneshot::channel();
                room.deferred.push(DeferredOp::Count(tx));
                Wait::Deferred(rx)
            } else if let Some(room_id) = room.room_id.clone() {
                let mut request = Request::new(
                    Uuid::new_v4().to_string(),
                    RequestArgs::new("realtime", "count"),
                    Some(json!({ "roomId": room_id })),
                );
                self.decorate(&mut st, &mut request);
                let (tx, rx) = oneshot::channel();
                self.send_request(&mut st, request, Some(tx));
                Wait::Immediate(rx)
            } else {
                return Err(Error::InactiveRoom);
            }
        };
        match wait {
            Wait::Immediate(rx) => {
                let response = rx.await.map_err(|_| Error::Canceled)??;
                response
                    .result
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Subscription("count response missing count".to_string()))
            }
            Wait::Deferred(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Canceled),
            },
        }
    }

    /// Throttled token invalidation: clears the token, detaches rooms and
    /// re-establishes them (unauthenticated) when still connected.
    fn token_expired(self: &Arc<Self>) {
        {
            let mut st = self.lock();
            let now = Instant::now();
            if let Some(last) = st.last_token_expired {
                if now.duration_since(last) < self.config.token_expired_interval {
                    return; // recently handled
                }
            }
            st.last_token_expired = Some(now);
            st.token = None;
            st.rooms.park_active();
        }
        self.emitter.emit(Event::TokenExpired);
        if self.lock().connection.is_open() {
            self.renew_parked();
        }
    }

    async fn check_token(self: Arc<Self>, token: String) -> bool {
        let rx = {
            let mut st = self.lock();
            if !st.connection.is_open() {
                return true; // cannot check now, keep the token
            }
            let mut request = Request::new(
                Uuid::new_v4().to_string(),
                RequestArgs::new("auth", "checkToken"),
                Some(json!({ "token": token })),
            );
            self.decorate(&mut st, &mut request);
            let (tx, rx) = oneshot::channel();
            self.send_request(&mut st, request, Some(tx));
            rx
        };
        match rx.await {
            Ok(Ok(response)) => response
                .result
                .get("valid")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            // an errored check invalidates the token
            _ => false,
        }
    }

    fn handle_connected(self: &Arc<Self>) {
        {
            let mut st = self.lock();
            st.connection = ConnectionState::Connected;
            if st.auto_queue {
                st.queuing = false;
            }
            tracing::debug!("transport connected");
        }
        self.renew_parked();
        {
            let mut st = self.lock();
            if st.auto_replay {
                if let Err(err) = self.start_replay(&mut st) {
                    tracing::error!("offline queue replay aborted: {err}");
                    self.emitter.emit(Event::Error {
                        message: err.to_string(),
                    });
                }
            }
            st.connection = ConnectionState::Ready;
        }
        self.emitter.emit(Event::Connected);
    }

    async fn handle_reconnected(self: Arc<Self>) {
        {
            let mut st = self.lock();
            if st.connection.is_terminal() {
                return;
            }
            st.connection = ConnectionState::Connected;
            if st.auto_queue {
                st.queuing = false;
            }
            tracing::debug!("transport reconnected");
        }
        // re-validate the stored token before declaring the reconnection
        // complete; renewal and replay proceed regardless of the outcome
        let token = { self.lock().token.clone() };
        if let Some(token) = token {
            if !Arc::clone(&self).check_token(token).await {
                self.token_expired();
            }
            if self.lock().connection != ConnectionState::Connected {
                return; // state changed while checking
            }
        }
        let auto_resubscribe = { self.lock().auto_resubscribe };
        if auto_resubscribe {
            self.renew_parked();
        }
        {
            let mut st = self.lock();
            if st.auto_replay {
                self.clean_queue(&mut st);
                if let Err(err) = self.start_replay(&mut st) {
                    tracing::error!("offline queue replay aborted: {err}");
                    self.emitter.emit(Event::Error {
                        message: err.to_string(),
                    });
                }
            }
            st.connection = ConnectionState::Ready;
        }
        self.emitter.emit(Event::Reconnected);
    }

    fn handle_connect_error(&self, message: String) {
        {
            let mut st = self.lock();
            if st.connection.is_terminal() {
                return;
            }
            st.connection = ConnectionState::Error;
        }
        self.emitter.emit(Event::Error {
            message: format!("connection error: {message}"),
        });
    }

    fn handle_disconnected(self: &Arc<Self>) {
        {
            let mut st = self.lock();
            if st.connection.is_terminal() {
                return;
            }
            st.connection = ConnectionState::Offline;
            if st.auto_queue {
                st.queuing = true;
            }
            st.rooms.park_active();
            tracing::debug!("transport disconnected");
        }
        self.emitter.emit(Event::Disconnected);
        if !self.transport.auto_reconnect() {
            self.shutdown();
        }
    }

    fn handle_network_error(self: &Arc<Self>, message: String) {
        {
            let mut st = self.lock();
            if st.connection.is_terminal() {
                return;
            }
            st.connection = ConnectionState::Offline;
            if st.auto_queue {
                st.queuing = true;
            }
            st.rooms.park_active();
            tracing::debug!("transport network error: {message}");
        }
        self.emitter.emit(Event::NetworkError { message });
    }

    /// Routes one inbound payload: a response when its room key matches a
    /// pending request, a subscription notification otherwise.
    fn handle_message(self: &Arc<Self>, room: String, payload: Value) {
        let mut st = self.lock();
        if st.correlator.is_pending(&room) {
            let response = match Response::from_value(payload) {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!("unparseable response for {room}: {err}");
                    return;
                }
            };
            let disposition = st.correlator.resolve(&room, response);
            drop(st);
            if let Some(disposition) = disposition {
                if let Some(error) = disposition.error {
                    self.emitter.emit(Event::QueryError {
                        message: error.message,
                        request_id: room,
                    });
                }
                if disposition.token_expired {
                    self.token_expired();
                }
            }
            return;
        }

        let mut notification = match Notification::from_value(payload) {
            Ok(notification) => notification,
            Err(err) => {
                tracing::warn!("unparseable notification on {room}: {err}");
                return;
            }
        };
        let from_self = match notification.request_id.clone() {
            Some(request_id) => st.correlator.consume_own(&request_id),
            None => false,
        };
        notification.from_self = from_self;
        if notification.room.is_none() {
            notification.room = Some(room.clone());
        }
        let targets: Vec<NotifyFn> = st
            .rooms
            .occupants(&room)
            .into_iter()
            .filter(|(_, _, subscribe_to_self)| !from_self || *subscribe_to_self)
            .map(|(_, notify, _)| notify)
            .collect();
        drop(st);
        for notify in targets {
            notify(notification.clone());
        }
    }

    /// Hard cancellation: terminal state, queue discarded, completions and
    /// subscriptions dropped, transport released.
    fn shutdown(self: &Arc<Self>) {
        {
            let mut st = self.lock();
            if st.connection.is_terminal() {
                return;
            }
            st.connection = ConnectionState::Disconnected;
            st.queuing = false;
            st.replaying = false;
            tracing::debug!(
                dropped = st.queue.len(),
                outstanding = st.correlator.pending_len(),
                "engine invalidated"
            );
            st.queue.clear();
            st.correlator.cancel_all();
            st.rooms.clear();
        }
        self.transport.close();
        self.emitter.emit(Event::Disconnected);
    }
}

async fn dispatch_events(
    inner: Arc<EngineInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        if inner.lock().connection.is_terminal() {
            break;
        }
        match event {
            TransportEvent::Connected => inner.handle_connected(),
            TransportEvent::Reconnected => {
                // spawned so the token check's own response can still be
                // dispatched while the reconnect sequence awaits it
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { inner.handle_reconnected().await });
            }
            TransportEvent::ConnectError { message } => inner.handle_connect_error(message),
            TransportEvent::Disconnected => inner.handle_disconnected(),
            TransportEvent::NetworkError { message } => inner.handle_network_error(message),
            TransportEvent::Message { room, payload } => inner.handle_message(room, payload),
        }
    }
}

async fn sweep_history_task(inner: Weak<EngineInner>) {
    let mut ticker = tokio::time::interval(HISTORY_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut st = inner.lock();
        if st.connection.is_terminal() {
            return;
        }
        st.correlator.sweep_history(Instant::now(), HISTORY_TTL);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
