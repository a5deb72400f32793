//! Contains the events and listener trait for observing the pool's CMAP-style lifecycle.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use crate::options::Address;

/// The reason a connection was closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The pool has been cleared since the connection was created.
    Stale,
    /// The connection has been available for longer than `max_idle_time`.
    Idle,
    /// An error occurred while using the connection.
    Error,
    /// The pool was closed.
    PoolClosed,
}

/// The reason a checkout attempt failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CheckOutFailedReason {
    /// The pool has been closed.
    PoolClosed,
    /// The checkout exceeded `wait_queue_timeout`.
    Timeout,
    /// An error occurred while establishing a connection for the checkout.
    ConnectionError,
}

/// Event emitted when a pool is created.
#[derive(Clone, Debug)]
pub struct PoolCreatedEvent {
    pub address: Address,
}

/// Event emitted the first time a pool transitions into the READY state.
#[derive(Clone, Debug)]
pub struct PoolReadyEvent {
    pub address: Address,
}

/// Event emitted when a pool's generation is bumped by a reset.
#[derive(Clone, Debug)]
pub struct PoolClearedEvent {
    pub address: Address,
}

/// Event emitted after the pool's worker task has fully drained and exited.
#[derive(Clone, Debug)]
pub struct PoolClosedEvent {
    pub address: Address,
}

/// Event emitted when a new connection begins establishment.
#[derive(Clone, Debug)]
pub struct ConnectionCreatedEvent {
    pub address: Address,
    pub connection_id: u32,
}

/// Event emitted once a connection has completed handshake and authentication.
#[derive(Clone, Debug)]
pub struct ConnectionReadyEvent {
    pub address: Address,
    pub connection_id: u32,
    pub duration: Duration,
}

/// Event emitted when a connection is closed and removed from the pool's bookkeeping.
#[derive(Clone, Debug)]
pub struct ConnectionClosedEvent {
    pub address: Address,
    pub connection_id: u32,
    pub reason: ConnectionClosedReason,
}

/// Event emitted when a checkout begins.
#[derive(Clone, Debug)]
pub struct CheckOutStartedEvent {
    pub address: Address,
}

/// Event emitted when a checkout successfully acquires a connection.
#[derive(Clone, Debug)]
pub struct CheckedOutEvent {
    pub address: Address,
    pub connection_id: u32,
    pub duration: Duration,
}

/// Event emitted when a checkout fails.
#[derive(Clone, Debug)]
pub struct CheckOutFailedEvent {
    pub address: Address,
    pub reason: CheckOutFailedReason,
}

/// Event emitted when a connection is returned to the pool.
#[derive(Clone, Debug)]
pub struct CheckedInEvent {
    pub address: Address,
    pub connection_id: u32,
}

/// A single CMAP-style event, as delivered to [`EventListener::handle`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PoolEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    CheckOutStarted(CheckOutStartedEvent),
    CheckedOut(CheckedOutEvent),
    CheckOutFailed(CheckOutFailedEvent),
    CheckedIn(CheckedInEvent),
}

impl PoolEvent {
    /// Short, stable name used in log lines and by tests asserting on event ordering.
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::PoolCreated(_) => "PoolCreated",
            PoolEvent::PoolReady(_) => "PoolReady",
            PoolEvent::PoolCleared(_) => "PoolCleared",
            PoolEvent::PoolClosed(_) => "PoolClosed",
            PoolEvent::ConnectionCreated(_) => "ConnectionCreated",
            PoolEvent::ConnectionReady(_) => "ConnectionReady",
            PoolEvent::ConnectionClosed(_) => "ConnectionClosed",
            PoolEvent::CheckOutStarted(_) => "CheckOutStarted",
            PoolEvent::CheckedOut(_) => "CheckedOut",
            PoolEvent::CheckOutFailed(_) => "CheckOutFailed",
            PoolEvent::CheckedIn(_) => "CheckedIn",
        }
    }
}

/// Implemented by types that want to observe pool lifecycle events.
///
/// A default no-op body is provided for every method so implementors only override the
/// events they care about. The pool calls these synchronously and in order from its single
/// worker task, so calls are serialized per pool; a panicking implementation is caught and
/// logged rather than allowed to unwind into the worker.
pub trait EventListener: Send + Sync {
    fn handle(&self, event: PoolEvent) {
        let _ = event;
    }
}

/// Emits events to an optional listener and mirrors every event through `tracing` (when the
/// `tracing-unstable` feature is enabled) regardless of whether a listener is configured.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    listener: Option<Arc<dyn EventListener>>,
    address: Address,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("address", &self.address)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

impl EventEmitter {
    pub(crate) fn new(listener: Option<Arc<dyn EventListener>>, address: Address) -> Self {
        Self { listener, address }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    /// Emits `event`, built lazily by `make` so that constructing an event (which may capture
    /// an `Instant::now()` or format a message) costs nothing when there is no listener and
    /// tracing is disabled at the active log level.
    pub(crate) fn emit(&self, make: impl FnOnce() -> PoolEvent) {
        #[cfg(feature = "tracing-unstable")]
        {
            let event = make();
            self.log(&event);
            self.dispatch(event);
        }
        #[cfg(not(feature = "tracing-unstable"))]
        {
            if self.listener.is_some() {
                self.dispatch(make());
            }
        }
    }

    fn dispatch(&self, event: PoolEvent) {
        if let Some(listener) = &self.listener {
            let listener = listener.clone();
            // Listener code is caller-supplied and must never be allowed to take the worker
            // task down with it.
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener.handle(event))).is_err() {
                #[cfg(feature = "tracing-unstable")]
                tracing::warn!(address = %self.address, "CMAP event listener panicked");
            }
        }
    }

    #[cfg(feature = "tracing-unstable")]
    fn log(&self, event: &PoolEvent) {
        tracing::debug!(address = %self.address, event = event.name(), "cmap event");
    }
}
