//! The connection entity: a handshaked, optionally authenticated stream plus its metadata.

pub(crate) mod pooled;

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::{
    collab::{HandshakeReply, StreamHealth},
    event::{ConnectionClosedReason, EventEmitter, PoolEvent},
    options::Address,
};

/// Metadata for a connection that has been allocated an id and generation but does not yet
/// have an established stream. Exists so the "reserve a creation slot, then dial off-task"
/// split can carry the connection's identity across that boundary.
#[derive(Clone, Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: Address,
    pub(crate) generation: u32,
    pub(crate) time_created: Instant,
    pub(crate) event_emitter: EventEmitter,
    pub(crate) socket_timeout: Option<Duration>,
}

impl PendingConnection {
    pub(crate) fn emit_created(&self) {
        let address = self.address.clone();
        let id = self.id;
        self.event_emitter.emit(move || {
            PoolEvent::ConnectionCreated(crate::event::ConnectionCreatedEvent {
                address,
                connection_id: id,
            })
        });
    }
}

/// A single pool-scoped connection: a stream plus the metadata the pool needs to decide
/// whether it may still be reused.
///
/// Never constructed directly by callers -- reached only by dereferencing a
/// [`PooledConnection`](crate::conn::pooled::PooledConnection) returned from
/// [`Pool::checkout`](crate::Pool::checkout).
#[derive(Debug)]
pub struct Connection<S> {
    pub(crate) id: u32,
    pub(crate) address: Address,
    pub(crate) stream: Option<S>,
    pub(crate) generation: u32,
    pub(crate) time_created: Instant,
    pub(crate) last_checkin_time: Instant,
    pub(crate) is_writable: Option<bool>,
    pub(crate) max_document_size: usize,
    pub(crate) max_message_size: usize,
    pub(crate) max_write_batch_size: usize,
    pub(crate) max_wire_version: i32,
    pub(crate) compression: Option<String>,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) closed: bool,
    /// Tripped to unblock any in-flight read/write on this connection promptly when it's
    /// closed rather than waiting out a socket-level timeout.
    pub(crate) cancellation: CancellationToken,
}

impl<S> Connection<S> {
    /// The pool-scoped id assigned to this connection at creation.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The address of the endpoint this connection is dialed to.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The pool generation this connection was created under.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// The largest single document the handshaked server will accept, in bytes.
    pub fn max_document_size(&self) -> usize {
        self.max_document_size
    }

    /// The largest single wire message the handshaked server will accept, in bytes.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// The largest batch of documents the handshaked server will accept in one operation.
    pub fn max_write_batch_size(&self) -> usize {
        self.max_write_batch_size
    }

    /// The highest wire protocol version the handshaked server advertised.
    pub fn max_wire_version(&self) -> i32 {
        self.max_wire_version
    }

    /// The compressor negotiated during handshake, if any.
    pub fn compression(&self) -> Option<&str> {
        self.compression.as_deref()
    }

    /// Whether the handshaked server identified itself as writable. `None` if no handshake has
    /// completed yet.
    pub fn is_writable(&self) -> Option<bool> {
        self.is_writable
    }

    /// Whether this connection has already been closed (e.g. by
    /// [`PooledConnection::invalidate`](crate::conn::pooled::PooledConnection::invalidate)).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The per send/recv deadline collaborators (the wire codec) should apply to operations on
    /// this connection, as configured by [`PoolOptions::socket_timeout`](crate::options::PoolOptions::socket_timeout).
    /// The pool itself never reads from or writes to the stream, so it cannot enforce this
    /// directly -- it only carries the value through to whoever does.
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
    }

    /// Mutable access to the underlying stream, for collaborators (the wire codec) that send
    /// and receive on it. Panics if called on a connection whose stream has already been
    /// taken by [`Connection::close`] -- callers never observe this because a closed
    /// connection is never handed back out by the pool.
    pub fn stream_mut(&mut self) -> &mut S {
        self.stream.as_mut().expect("stream present on a non-closed connection")
    }

    pub(crate) fn new(pending: &PendingConnection, stream: S) -> Self {
        let reply = HandshakeReply::default();
        Self {
            id: pending.id,
            address: pending.address.clone(),
            stream: Some(stream),
            generation: pending.generation,
            time_created: pending.time_created,
            last_checkin_time: Instant::now(),
            is_writable: None,
            max_document_size: reply.max_document_size,
            max_message_size: reply.max_message_size,
            max_write_batch_size: reply.max_write_batch_size,
            max_wire_version: reply.max_wire_version,
            compression: None,
            socket_timeout: pending.socket_timeout,
            closed: false,
            cancellation: CancellationToken::new(),
        }
    }

    pub(crate) fn apply_handshake(&mut self, reply: HandshakeReply) {
        self.is_writable = Some(reply.writable);
        self.max_document_size = reply.max_document_size;
        self.max_message_size = reply.max_message_size;
        self.max_write_batch_size = reply.max_write_batch_size;
        self.max_wire_version = reply.max_wire_version;
        self.compression = reply.compression;
    }

    /// A token that is cancelled when this connection closes, for use alongside an in-flight
    /// read/write in a `tokio::select!` so it unblocks promptly instead of waiting out a
    /// socket-level timeout.
    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub(crate) fn is_stale(&self, pool_generation: u32) -> bool {
        self.generation != pool_generation
    }

    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match max_idle_time {
            Some(max_idle_time) => Instant::now().duration_since(self.last_checkin_time) >= max_idle_time,
            None => false,
        }
    }

    pub(crate) fn mark_checked_in(&mut self) {
        self.last_checkin_time = Instant::now();
    }

    pub(crate) fn idle_duration(&self) -> Duration {
        Instant::now().duration_since(self.last_checkin_time)
    }

    /// Idempotent close: flips the closed flag, trips the cancellation handle, and drops the
    /// underlying stream. `reason` of `None` suppresses the close event (used so a connection
    /// already logically closed isn't logged twice).
    pub(crate) fn close(&mut self, reason: Option<ConnectionClosedReason>, emitter: &EventEmitter) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancellation.cancel();
        self.stream.take();

        if let Some(reason) = reason {
            let address = self.address.clone();
            let id = self.id;
            emitter.emit(move || {
                PoolEvent::ConnectionClosed(crate::event::ConnectionClosedEvent {
                    address,
                    connection_id: id,
                    reason,
                })
            });
        }
    }
}

impl<S: StreamHealth> Connection<S> {
    /// A cheap, non-blocking probe for whether the peer has already closed this connection's
    /// stream. A connection with no stream (already closed on our side) counts as closed.
    pub(crate) fn is_closed_by_peer(&self) -> bool {
        self.stream.as_ref().map_or(true, |s| s.is_closed())
    }
}
