//! A bounded, generation-tagged connection pool for a single remote server endpoint.
//!
//! This crate implements the Connection Monitoring and Pooling (CMAP) state machine: a
//! [`Pool`] keeps a bounded set of handshaked, optionally authenticated connections warm,
//! hands them out to callers for the duration of one logical operation via the RAII
//! [`PooledConnection`] guard, and reclaims them automatically when that guard drops.
//!
//! The pool itself never dials a socket, speaks a wire protocol, or authenticates a
//! credential -- those are narrow collaborator traits in [`collab`] supplied by the
//! embedding driver. This crate ships one concrete [`collab::Dialer`] implementation,
//! [`dialer::TcpUnixDialer`], as a convenience; the [`collab::Handshaker`] and
//! [`collab::Authenticator`] sides are always supplied externally.
//!
//! Pool state lives entirely inside a single `tokio` task (the "worker"); every public
//! method on [`Pool`] is a cheap channel send/await, never a lock acquisition. See
//! `DESIGN.md` in the crate repository for the mapping from the classical mutex + two
//! condvar design onto this actor-based rendition.

pub mod collab;
pub mod conn;
pub mod dialer;
pub mod error;
pub(crate) mod establish;
pub mod event;
pub mod options;
pub mod pool;

#[cfg(any(test, feature = "test-util"))]
pub mod testkit;

pub use conn::{pooled::PooledConnection, Connection};
pub use error::{Error, ErrorKind, Result};
pub use options::{Address, PoolOptions};
pub use pool::Pool;
