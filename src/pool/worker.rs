//! The pool's single-task actor: owns every piece of mutable pool state described in the
//! design document's §3 and implements the state machine of §4 as a `tokio::select!` loop.
//!
//! No field on [`PoolWorker`] is ever touched by more than one task -- that's the whole point
//! of the actor rendition (§5 of the design document): there is no primary lock because there
//! is nothing to share.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    collab::{Authenticator, Credential, Dialer, Handshaker, StreamHealth},
    conn::{pooled::PooledConnection, Connection, PendingConnection},
    error::Error,
    establish::ConnectionEstablisher,
    event::{
        CheckOutFailedReason, CheckedInEvent, ConnectionClosedReason, EventEmitter, PoolClearedEvent,
        PoolClosedEvent, PoolCreatedEvent, PoolEvent, PoolReadyEvent,
    },
    options::{Address, PoolOptions},
    pool::{
        handle::WorkerHandleListener,
        manager::{self, ManagementRequest, ManagementRequestReceiver, PoolManager},
        requester::{self, ConnectionRequest, ConnectionRequestReceiver, ConnectionRequestResult},
        status::{self, PoolGenerationPublisher, PoolGenerationSubscriber},
    },
};

/// How often the worker's internal timer drives a maintenance pass, independent of any
/// caller-visible option. The distilled spec treats maintenance as invoked by an "external
/// scheduler"; this crate's rendition of that scheduler is this interval, ticking inside the
/// worker's own `select!` loop (see DESIGN.md).
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

/// PAUSED / READY, mirroring §4.1. CLOSED is not a variant here: it is reached by the worker's
/// `execute` loop breaking and returning, never by a state transition a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Paused,
    Ready,
}

/// Owns all pool state and runs as a detached `tokio` task, reached only through the channel
/// handles in [`PoolManager`] and the checkout-request channel in
/// [`requester`](crate::pool::requester).
pub(crate) struct PoolWorker<D, H, A>
where
    D: Dialer,
    H: Handshaker<D::Stream>,
    A: Authenticator<D::Stream>,
{
    address: Address,
    state: PoolState,
    pause_enabled: bool,

    /// Every connection this pool currently accounts for: checked out, idle, or mid-dial.
    /// Bounds `max_pool_size` together with `pending_creates` via `below_max_pool_size`.
    total_connection_count: u32,
    active_checkouts: u32,
    pending_creates: u32,
    next_connection_id: u32,
    generation: u32,

    max_pool_size: Option<u32>,
    min_pool_size: Option<u32>,
    max_connecting: u32,
    max_idle_time: Option<Duration>,
    max_waiters: Option<u32>,
    check_interval: Duration,
    socket_timeout: Option<Duration>,

    /// Idle connections, back = most-recently-checked-in (reused first), front = oldest (pruned
    /// first by maintenance). See DESIGN.md for the mapping onto the distilled spec's
    /// front/back terminology.
    idle: VecDeque<Connection<D::Stream>>,
    wait_queue: VecDeque<ConnectionRequest<D::Stream>>,

    establisher: ConnectionEstablisher<D, H, A>,
    credential: Option<Credential>,
    event_emitter: EventEmitter,

    owner_pid: u32,

    handle_listener: WorkerHandleListener,
    request_receiver: ConnectionRequestReceiver<D::Stream>,
    management_receiver: ManagementRequestReceiver<D::Stream>,
    generation_publisher: PoolGenerationPublisher,
    manager: PoolManager<D::Stream>,
}

/// What the worker's `select!` loop picked up this iteration.
enum WorkerTask<S> {
    CheckOut(ConnectionRequest<S>),
    Management(ManagementRequest<S>),
    Maintenance,
}

impl<D, H, A> PoolWorker<D, H, A>
where
    D: Dialer,
    H: Handshaker<D::Stream>,
    A: Authenticator<D::Stream>,
{
    /// Builds and spawns the worker, returning the handles callers use to reach it. The worker
    /// itself is never returned -- by design, nothing outside this module ever owns it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        address: Address,
        options: &PoolOptions,
        dialer: Arc<D>,
        handshaker: Arc<H>,
        authenticator: Arc<A>,
        credential: Option<Credential>,
    ) -> (
        PoolManager<D::Stream>,
        requester::ConnectionRequester<D::Stream>,
        PoolGenerationSubscriber,
    ) {
        let event_emitter = EventEmitter::new(options.event_listener.clone(), address.clone());
        event_emitter.emit(|| PoolEvent::PoolCreated(PoolCreatedEvent { address: address.clone() }));

        let establisher = ConnectionEstablisher::new(
            dialer,
            handshaker,
            authenticator,
            options.connect_timeout,
            options.app_name.clone(),
        );

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (requester, request_receiver) = requester::ConnectionRequester::new(handle);
        let (manager, management_receiver) = manager::PoolManager::new();
        let (generation_publisher, generation_subscriber) = status::channel(0);

        let state = if options.pause_enabled { PoolState::Paused } else { PoolState::Ready };

        let worker = PoolWorker {
            address,
            state,
            pause_enabled: options.pause_enabled,
            total_connection_count: 0,
            active_checkouts: 0,
            pending_creates: 0,
            next_connection_id: 1,
            generation: 0,
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_connecting: options.max_connecting,
            max_idle_time: options.max_idle_time,
            max_waiters: options.max_waiters(),
            check_interval: options.check_interval,
            socket_timeout: options.socket_timeout,
            idle: VecDeque::new(),
            wait_queue: VecDeque::new(),
            establisher,
            credential,
            event_emitter,
            owner_pid: std::process::id(),
            handle_listener,
            request_receiver,
            management_receiver,
            generation_publisher,
            manager: manager.clone(),
        };

        tokio::spawn(worker.execute());

        (manager, requester, generation_subscriber)
    }

    async fn execute(mut self) {
        let mut maintenance_tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let task = tokio::select! {
                // Checkins, clears, and ready calls always take priority over servicing new
                // checkouts and over maintenance, matching the design document's §4.1 note
                // that every transition runs to completion before the next is considered.
                biased;

                Some(request) = self.management_receiver.recv() => WorkerTask::Management(request),
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                Some(request) = self.request_receiver.recv() => WorkerTask::CheckOut(request),
                _ = maintenance_tick.tick() => WorkerTask::Maintenance,
                else => break,
            };

            self.check_fork();

            match task {
                WorkerTask::CheckOut(request) => self.handle_incoming_checkout(request),
                WorkerTask::Management(request) => self.handle_management(request),
                WorkerTask::Maintenance => self.perform_maintenance(),
            }

            if self.can_service_connection_request() {
                if let Some(request) = self.wait_queue.pop_front() {
                    self.service_checkout(request);
                }
            }
        }

        while let Some(mut connection) = self.idle.pop_front() {
            connection.close(Some(ConnectionClosedReason::PoolClosed), &self.event_emitter);
        }
        self.event_emitter
            .emit(|| PoolEvent::PoolClosed(PoolClosedEvent { address: self.address.clone() }));
    }

    /// §5: compares the pid recorded at construction to the current one at every ingress. A
    /// mismatch means this task's connections were inherited across a `fork()` the child must
    /// not reuse -- treated as an implicit reset without bumping the generation twice over (a
    /// real reset may also be in flight; zeroing here is idempotent with that).
    fn check_fork(&mut self) {
        let current_pid = std::process::id();
        if current_pid == self.owner_pid {
            return;
        }
        self.owner_pid = current_pid;
        self.active_checkouts = 0;
        for mut connection in self.idle.drain(..) {
            connection.close(None, &self.event_emitter);
        }
        self.total_connection_count = self.pending_creates;
    }

    fn below_max_pool_size(&self) -> bool {
        match self.max_pool_size {
            Some(max) => self.total_connection_count < max,
            None => true,
        }
    }

    fn can_service_connection_request(&self) -> bool {
        if self.state != PoolState::Ready {
            return false;
        }
        if !self.idle.is_empty() {
            return true;
        }
        self.below_max_pool_size() && self.pending_creates < self.max_connecting
    }

    fn handle_incoming_checkout(&mut self, request: ConnectionRequest<D::Stream>) {
        match self.state {
            PoolState::Paused => {
                let _ = request.fulfill(ConnectionRequestResult::Unavailable(Error::pool_paused(
                    self.address.to_string(),
                )));
            }
            PoolState::Ready => {
                if let Some(max_waiters) = self.max_waiters {
                    if self.wait_queue.len() as u32 >= max_waiters {
                        let _ = request.fulfill(ConnectionRequestResult::Unavailable(
                            Error::exceeded_max_waiters(self.address.to_string(), max_waiters),
                        ));
                        return;
                    }
                }
                self.wait_queue.push_back(request);
            }
        }
    }

    /// §4.2 steps 5-6: pop from the idle deque, skipping perished connections, then fall back
    /// to reserving a creation slot. Called only once per loop iteration, mirroring the
    /// teacher's pacing -- the loop simply runs again immediately if more can be serviced.
    fn service_checkout(&mut self, request: ConnectionRequest<D::Stream>) {
        while let Some(connection) = self.idle.pop_back() {
            if let Some(reason) = self.perished_reason(&connection) {
                self.close_connection(connection, reason);
                continue;
            }

            self.active_checkouts += 1;
            if let Err(result) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(connection))) {
                // The caller's wait_queue_timeout elapsed and it stopped listening; put the
                // connection back rather than lose it.
                if let ConnectionRequestResult::Pooled(connection) = result {
                    self.active_checkouts -= 1;
                    self.idle.push_back(*connection);
                }
            }
            return;
        }

        if self.pending_creates < self.max_connecting && self.below_max_pool_size() {
            self.pending_creates += 1;
            self.total_connection_count += 1;
            let pending = self.create_pending_connection();
            let establisher = self.establisher.clone();
            let manager = self.manager.clone();
            let credential = self.credential.clone();
            let generation_at_start = self.generation;

            // The caller's wait_queue_timeout may elapse while this dial/handshake/auth is
            // still in flight -- that can take the full connect_timeout, not a few
            // microseconds, so whether the caller is still listening can only be known once
            // establishment has actually finished. `request.fulfill` tells us that directly:
            // it fails iff the caller already dropped its receiver. Deliver first, then true
            // up the worker's counters based on the outcome, so nothing is ever counted as
            // checked out unless a caller really received it.
            tokio::spawn(async move {
                match establisher.establish(pending, credential.as_ref()).await {
                    Ok(connection) => {
                        match request.fulfill(ConnectionRequestResult::Pooled(Box::new(connection))) {
                            Ok(()) => manager.checkout_establish_succeeded(),
                            Err(ConnectionRequestResult::Pooled(connection)) => {
                                manager.backfill_establish_succeeded(*connection, generation_at_start)
                            }
                            Err(ConnectionRequestResult::Unavailable(_)) => unreachable!(
                                "fulfill is only ever called here with ConnectionRequestResult::Pooled"
                            ),
                        }
                    }
                    Err(error) => {
                        let _ = request.fulfill(ConnectionRequestResult::Unavailable(error));
                        manager.establish_failed();
                    }
                }
            });
        } else {
            self.wait_queue.push_front(request);
        }
    }

    fn perished_reason(&self, connection: &Connection<D::Stream>) -> Option<ConnectionClosedReason> {
        if connection.is_idle(self.max_idle_time) {
            return Some(ConnectionClosedReason::Idle);
        }
        if connection.is_stale(self.generation) {
            return Some(ConnectionClosedReason::Stale);
        }
        if self.should_check_liveness(connection) && connection.is_closed_by_peer() {
            return Some(ConnectionClosedReason::Error);
        }
        None
    }

    fn should_check_liveness(&self, connection: &Connection<D::Stream>) -> bool {
        self.check_interval.is_zero() || connection.idle_duration() >= self.check_interval
    }

    fn create_pending_connection(&mut self) -> PendingConnection {
        let pending = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: Instant::now(),
            event_emitter: self.event_emitter.clone(),
            socket_timeout: self.socket_timeout,
        };
        self.next_connection_id += 1;
        pending.emit_created();
        pending
    }

    fn handle_management(&mut self, request: ManagementRequest<D::Stream>) {
        match request {
            ManagementRequest::CheckIn(connection) => self.check_in(connection),
            ManagementRequest::Clear { pause, completion } => {
                self.clear(pause);
                let _ = completion.send(());
            }
            ManagementRequest::MarkReady { completion } => {
                self.mark_ready();
                let _ = completion.send(());
            }
            ManagementRequest::Maintain { completion } => {
                self.perform_maintenance();
                let _ = completion.send(());
            }
            ManagementRequest::CheckoutEstablishSucceeded => {
                // The caller already received this exact connection directly from the
                // establishment task; this message exists purely to true up the accounting.
                self.pending_creates -= 1;
                self.active_checkouts += 1;
            }
            ManagementRequest::BackfillEstablishSucceeded {
                connection,
                generation_at_start,
            } => {
                self.pending_creates -= 1;
                if generation_at_start != self.generation {
                    // The world moved on (a reset happened) while this dial was in flight.
                    self.close_connection(*connection, ConnectionClosedReason::Stale);
                } else {
                    self.idle.push_back(*connection);
                }
            }
            ManagementRequest::EstablishFailed => {
                self.pending_creates -= 1;
                self.total_connection_count -= 1;
            }
        }
    }

    fn check_in(&mut self, mut connection: Connection<D::Stream>) {
        self.event_emitter.emit(|| {
            PoolEvent::CheckedIn(CheckedInEvent {
                address: self.address.clone(),
                connection_id: connection.id(),
            })
        });

        self.active_checkouts = self.active_checkouts.saturating_sub(1);

        if connection.is_closed() {
            self.total_connection_count = self.total_connection_count.saturating_sub(1);
        } else if connection.is_stale(self.generation) {
            self.close_connection(connection, ConnectionClosedReason::Stale);
        } else {
            connection.mark_checked_in();
            self.idle.push_back(connection);
        }
    }

    fn clear(&mut self, pause: bool) {
        let was_ready = self.state == PoolState::Ready;
        self.generation += 1;
        self.generation_publisher.publish(self.generation);
        if pause && self.pause_enabled {
            self.state = PoolState::Paused;
        }

        let drained: Vec<_> = self.idle.drain(..).collect();

        if pause {
            for request in self.wait_queue.drain(..) {
                let _ = request.fulfill(ConnectionRequestResult::Unavailable(Error::pool_paused(
                    self.address.to_string(),
                )));
            }
        }

        if was_ready {
            self.event_emitter
                .emit(|| PoolEvent::PoolCleared(PoolClearedEvent { address: self.address.clone() }));
        }

        for connection in drained {
            self.close_connection(connection, ConnectionClosedReason::Stale);
        }
    }

    fn mark_ready(&mut self) {
        if self.state == PoolState::Ready {
            return;
        }
        self.state = PoolState::Ready;
        self.event_emitter
            .emit(|| PoolEvent::PoolReady(PoolReadyEvent { address: self.address.clone() }));
    }

    fn close_connection(&mut self, mut connection: Connection<D::Stream>, reason: ConnectionClosedReason) {
        connection.close(Some(reason), &self.event_emitter);
        self.total_connection_count = self.total_connection_count.saturating_sub(1);
    }

    /// §4.4. Skipped entirely while paused; idle-pruning stops at the first non-perished
    /// connection since everything behind it was checked in more recently and so can't be
    /// idle for longer.
    fn perform_maintenance(&mut self) {
        if self.state != PoolState::Ready {
            return;
        }
        self.prune_idle();
        self.ensure_min_connections();
    }

    fn prune_idle(&mut self) {
        while let Some(connection) = self.idle.pop_front() {
            if connection.is_stale(self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, ConnectionClosedReason::Idle);
            } else {
                self.idle.push_front(connection);
                break;
            }
        }
    }

    fn ensure_min_connections(&mut self) {
        let Some(min_pool_size) = self.min_pool_size else { return };

        while self.total_connection_count < min_pool_size && self.pending_creates < self.max_connecting {
            self.pending_creates += 1;
            self.total_connection_count += 1;
            let pending = self.create_pending_connection();
            let establisher = self.establisher.clone();
            let manager = self.manager.clone();
            let credential = self.credential.clone();
            let generation_at_start = self.generation;

            tokio::spawn(async move {
                match establisher.establish(pending, credential.as_ref()).await {
                    Ok(connection) => manager.backfill_establish_succeeded(connection, generation_at_start),
                    Err(_) => manager.establish_failed(),
                }
            });
        }
    }
}

/// Wraps a connection pulled off the idle deque or freshly established into the RAII handle a
/// caller receives from [`Pool::checkout`](crate::Pool::checkout). Emitting `CheckedOut` is the
/// caller's job, not this helper's: only `Pool::checkout` knows how long the caller waited.
pub(crate) fn wrap_checked_out<S>(
    connection: Connection<S>,
    manager: PoolManager<S>,
    event_emitter: EventEmitter,
) -> PooledConnection<S> {
    PooledConnection::new(connection, manager, event_emitter)
}

/// Maps a worker-internal failure into the `CheckOutFailed` reason the design document's §4.7
/// wants emitted alongside it.
pub(crate) fn checkout_failed_reason(error: &Error) -> CheckOutFailedReason {
    if error.is_wait_queue_timeout() {
        CheckOutFailedReason::Timeout
    } else if matches!(&*error.kind, crate::error::ErrorKind::PoolClosed { .. }) {
        CheckOutFailedReason::PoolClosed
    } else {
        CheckOutFailedReason::ConnectionError
    }
}
