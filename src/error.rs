//! Contains the `Error` and `Result` types that this crate uses.

use std::{io, sync::Arc, time::Duration};

use thiserror::Error;

/// The result type for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while using a [`Pool`](crate::Pool).
///
/// The inner [`ErrorKind`] is wrapped in an `Arc` so that `Error` stays cheaply `Clone`,
/// which is needed because the same failure (e.g. a pool clear) is often reported to many
/// waiters at once.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    pub(crate) fn pool_closed(address: impl Into<String>) -> Self {
        Self::new(ErrorKind::PoolClosed {
            address: address.into(),
        })
    }

    pub(crate) fn pool_paused(address: impl Into<String>) -> Self {
        Self::new(ErrorKind::PoolPaused {
            address: address.into(),
        })
    }

    pub(crate) fn wait_queue_timeout(address: impl Into<String>, timeout: Duration) -> Self {
        Self::new(ErrorKind::WaitQueueTimeout {
            address: address.into(),
            timeout,
        })
    }

    pub(crate) fn exceeded_max_waiters(address: impl Into<String>, max_waiters: u32) -> Self {
        Self::new(ErrorKind::ExceededMaxWaiters {
            address: address.into(),
            max_waiters,
        })
    }

    /// Builds a connection-failure error wrapping an OS/TLS-level [`io::Error`]. Available to
    /// any [`Dialer`](crate::collab::Dialer), [`Handshaker`](crate::collab::Handshaker), or
    /// [`Authenticator`](crate::collab::Authenticator) implementation outside this crate, since
    /// those collaborator methods all return [`Result`] and need a way to construct one.
    pub fn connection_failure(source: io::Error, is_timeout: bool) -> Self {
        Self::new(ErrorKind::ConnectionFailure {
            message: source.to_string(),
            source: Arc::new(source),
            is_timeout,
        })
    }

    /// Builds a TLS peer verification error, for a [`Dialer`](crate::collab::Dialer)
    /// implementation's TLS layer to report a failed certificate check.
    pub fn certificate_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Certificate {
            message: message.into(),
        })
    }

    /// Builds an authentication error, for an [`Authenticator`](crate::collab::Authenticator)
    /// implementation to report a rejected or malformed credential.
    pub fn authentication_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication {
            message: message.into(),
        })
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument {
            message: message.into(),
        })
    }

    /// Whether this error is a hint that the remote server may be unreachable and that a
    /// retry layer above this crate may want to attempt server re-selection.
    pub fn is_connection_failure(&self) -> bool {
        matches!(&*self.kind, ErrorKind::ConnectionFailure { .. })
    }

    /// Whether this error stems from the wait queue timing out rather than the pool itself
    /// being unusable.
    pub fn is_wait_queue_timeout(&self) -> bool {
        matches!(&*self.kind, ErrorKind::WaitQueueTimeout { .. })
    }
}

/// The kind of error that occurred.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A checkout was attempted after the pool had already closed (its worker task exited
    /// because every [`Pool`](crate::Pool) handle was dropped).
    #[error("connection pool for {address} is closed")]
    PoolClosed { address: String },

    /// A checkout was attempted, or a queued checkout was woken, while the pool was paused.
    #[error("connection pool for {address} is paused")]
    PoolPaused { address: String },

    /// A checkout did not acquire a connection before `wait_queue_timeout` elapsed.
    #[error("timed out after {timeout:?} waiting for a connection from the pool for {address}")]
    WaitQueueTimeout { address: String, timeout: Duration },

    /// A checkout was refused immediately because the wait queue was already full.
    #[error(
        "could not check out a connection from the pool for {address} because the wait queue \
         was already at its limit of {max_waiters}"
    )]
    ExceededMaxWaiters { address: String, max_waiters: u32 },

    /// Dialing, handshaking, or reading/writing a connection failed at the OS/TLS level.
    ///
    /// `is_timeout` distinguishes an OS-level timeout (including a TLS handshake timing out)
    /// from any other I/O failure; callers that want the "auto-reconnect" hint described in the
    /// design document should treat `!is_timeout` connection failures as such a hint.
    #[error("connection failure: {message}")]
    ConnectionFailure {
        message: String,
        #[source]
        source: Arc<io::Error>,
        is_timeout: bool,
    },

    /// TLS peer verification failed. Distinct from [`ErrorKind::ConnectionFailure`] because it
    /// should never be treated as an auto-reconnect hint.
    #[error("TLS certificate verification failed: {message}")]
    Certificate { message: String },

    /// The handshaked server rejected a message for exceeding its advertised size limit.
    #[error("attempted to send a message of {attempted} bytes, exceeding the {limit} byte limit")]
    DocumentTooLarge { attempted: usize, limit: usize },

    /// An unacknowledged write was attempted on a connection whose handshake reported it is
    /// not writable (e.g. a secondary/read-only endpoint).
    #[error("connection to {address} is not writable")]
    NotWritable { address: String },

    /// Authentication failed during connection establishment.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// A `PoolOptions` value failed validation.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_failure_is_flagged_as_such() {
        let error = Error::connection_failure(io::Error::other("boom"), false);
        assert!(error.is_connection_failure());
        assert!(!error.is_wait_queue_timeout());
    }

    #[test]
    fn wait_queue_timeout_is_flagged_as_such() {
        let error = Error::wait_queue_timeout("localhost:27017", Duration::from_millis(50));
        assert!(error.is_wait_queue_timeout());
        assert!(!error.is_connection_failure());
    }

    #[test]
    fn error_is_cheaply_cloneable() {
        let error = Error::pool_closed("localhost:27017");
        let clone = error.clone();
        assert!(Arc::ptr_eq(&error.kind, &clone.kind));
    }

    #[test]
    fn display_delegates_to_the_inner_kind() {
        let error = Error::pool_paused("localhost:27017");
        assert_eq!(error.to_string(), "connection pool for localhost:27017 is paused");
    }
}
