//! The RAII guard callers actually hold: a checked-out connection that checks itself back in
//! (or discards itself) when dropped.

use std::ops::{Deref, DerefMut};

use tokio_util::sync::CancellationToken;

use crate::{
    conn::Connection,
    event::{ConnectionClosedReason, EventEmitter},
    pool::manager::PoolManager,
};

/// A connection checked out of a [`Pool`](crate::Pool) for the duration of one logical
/// operation. Dereferences to the underlying [`Connection`]; dropping it (however that
/// happens -- normal scope exit, an early `return`, or a panic unwinding through it) returns
/// the connection to the pool, unless [`PooledConnection::invalidate`] was called first, in
/// which case it is discarded instead.
pub struct PooledConnection<S> {
    connection: Option<Connection<S>>,
    manager: PoolManager<S>,
    event_emitter: EventEmitter,
    should_discard: bool,
    cancellation: CancellationToken,
}

impl<S> PooledConnection<S> {
    pub(crate) fn new(connection: Connection<S>, manager: PoolManager<S>, event_emitter: EventEmitter) -> Self {
        let cancellation = connection.cancellation_token();
        Self {
            connection: Some(connection),
            manager,
            event_emitter,
            should_discard: false,
            cancellation,
        }
    }

    /// The pool-scoped id of this connection, stable across checkouts.
    pub fn id(&self) -> u32 {
        self.connection().id
    }

    /// Marks this connection so that, when it is checked in, the pool discards it (closed with
    /// reason [`ConnectionClosedReason::Error`]) instead of returning it to the idle deque.
    /// Call this after an I/O error on the connection -- the spec's propagation policy is that
    /// such a connection must never be reused.
    pub fn invalidate(&mut self) {
        self.should_discard = true;
    }

    /// A token cancelled once this connection is closed, for use in `tokio::select!` alongside
    /// an in-flight read/write so it can be unblocked promptly rather than waiting out a
    /// socket-level timeout.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    fn connection(&self) -> &Connection<S> {
        self.connection
            .as_ref()
            .expect("connection taken only in Drop")
    }

    fn connection_mut(&mut self) -> &mut Connection<S> {
        self.connection
            .as_mut()
            .expect("connection taken only in Drop")
    }
}

impl<S> Deref for PooledConnection<S> {
    type Target = Connection<S>;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl<S> DerefMut for PooledConnection<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection_mut()
    }
}

impl<S> Drop for PooledConnection<S> {
    fn drop(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        if self.should_discard {
            connection.close(Some(ConnectionClosedReason::Error), &self.event_emitter);
        }

        if let Err(mut connection) = self.manager.check_in(connection) {
            // The worker has already exited (pool closed): there's no one left to check in
            // to, so close directly and log it ourselves.
            connection.close(Some(ConnectionClosedReason::PoolClosed), &self.event_emitter);
        }
    }
}

impl<S> std::fmt::Debug for PooledConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.connection().id)
            .field("generation", &self.connection().generation)
            .field("should_discard", &self.should_discard)
            .finish_non_exhaustive()
    }
}
