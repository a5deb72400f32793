//! Narrow collaborator contracts the pool consumes but never implements itself.
//!
//! The pool is generic over a single stream type `S` supplied by a [`Dialer`]; the
//! [`Handshaker`] and [`Authenticator`] then operate on that same stream type. None of these
//! traits know anything about wire formats, authentication mechanisms, or TLS specifics -- that
//! is deliberately left to whoever plugs a collaborator in.

use std::{future::Future, pin::Pin, time::Duration};

use crate::{error::Result, options::Address};

/// A future returned by a collaborator method, boxed so the traits below stay object-adjacent
/// without requiring an external `async_trait`-style macro.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Negotiated limits and capabilities learned from a connection's handshake.
#[derive(Clone, Debug)]
pub struct HandshakeReply {
    /// Maximum size, in bytes, of a single document the server will accept.
    pub max_document_size: usize,
    /// Maximum size, in bytes, of a single wire message the server will accept.
    pub max_message_size: usize,
    /// Maximum number of documents the server will accept in one batch operation.
    pub max_write_batch_size: usize,
    /// The highest wire protocol version the server advertised support for.
    pub max_wire_version: i32,
    /// Whether the server identified itself as writable (e.g. a primary).
    pub writable: bool,
    /// The compressor the server and driver negotiated, if any.
    pub compression: Option<String>,
    /// Whether authentication was already satisfied speculatively during the handshake, so a
    /// separate [`Authenticator::authenticate`] call can be skipped.
    pub speculative_auth_completed: bool,
}

impl Default for HandshakeReply {
    fn default() -> Self {
        Self {
            max_document_size: 16 * 1024 * 1024,
            max_message_size: 48 * 1024 * 1024,
            max_write_batch_size: 100_000,
            max_wire_version: 0,
            writable: true,
            compression: None,
            speculative_auth_completed: false,
        }
    }
}

/// Credentials presented to an [`Authenticator`]. Opaque to the pool itself beyond what's
/// needed to decide whether a cached connection already satisfies them.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Credential {
    pub mechanism: Option<String>,
    pub source: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Dials a fresh byte-stream to `address`, honoring `timeout`. Implementations decide TCP vs.
/// UNIX domain socket framing and whether/how to layer TLS; the pool never touches a raw socket
/// itself.
pub trait Dialer: Send + Sync + 'static {
    /// The established, readable/writable stream type this dialer produces.
    type Stream: Send + Unpin + StreamHealth + 'static;

    fn dial<'a>(&'a self, address: &'a Address, timeout: Duration) -> BoxFuture<'a, Result<Self::Stream>>;
}

/// A cheap, non-blocking liveness probe a stream type can offer so the pool can detect a
/// remotely-closed socket before handing a perished connection back to a caller.
///
/// This is the only collaborator-facing trait with a default: implementing it is optional in
/// spirit (a stream that can't cheaply answer should just always report itself alive), but it
/// must be implemented explicitly because the pool is generic over arbitrary stream types.
pub trait StreamHealth {
    /// Returns `true` if a non-blocking probe observed the peer has closed the connection.
    /// Must never block or perform a full read.
    fn is_closed(&self) -> bool;
}

/// Performs the one-time protocol handshake on a freshly dialed stream.
pub trait Handshaker<S>: Send + Sync + 'static {
    fn handshake<'a>(
        &'a self,
        stream: &'a mut S,
        app_name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<HandshakeReply>>;
}

/// Authenticates a stream against a credential not already satisfied by speculative auth.
pub trait Authenticator<S>: Send + Sync + 'static {
    fn authenticate<'a>(&'a self, stream: &'a mut S, credential: &'a Credential) -> BoxFuture<'a, Result<()>>;
}
