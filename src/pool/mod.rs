//! The public, cloneable handle callers hold: [`Pool`]. Everything stateful lives in the
//! worker task spawned by [`Pool::new`]; this type and its submodules are just the channels
//! that reach it.

pub(crate) mod handle;
pub(crate) mod manager;
pub(crate) mod requester;
pub(crate) mod status;
#[cfg(test)]
mod test;
pub(crate) mod worker;

use std::{marker::PhantomData, time::Duration, time::Instant};

use crate::{
    collab::{Authenticator, Credential, Dialer, Handshaker},
    conn::pooled::PooledConnection,
    error::{Error, Result},
    event::{
        CheckOutFailedEvent, CheckOutStartedEvent, CheckedOutEvent, EventEmitter, PoolEvent,
    },
    options::{Address, PoolOptions},
    pool::{
        manager::PoolManager,
        requester::{ConnectionRequestResult, ConnectionRequester},
        status::PoolGenerationSubscriber,
        worker::{checkout_failed_reason, wrap_checked_out, PoolWorker},
    },
};

/// A connection pool for a single remote endpoint, implementing the CMAP state machine
/// described in the design document.
///
/// `Pool` is cheaply `Clone` -- every clone shares the same underlying worker task. The pool
/// closes itself once every clone (and every outstanding [`PooledConnection`]'s checked-in
/// path) is dropped; there is no explicit `close()` to call.
pub struct Pool<D, H, A>
where
    D: Dialer,
    H: Handshaker<D::Stream>,
    A: Authenticator<D::Stream>,
{
    address: Address,
    wait_queue_timeout: Option<Duration>,
    manager: PoolManager<D::Stream>,
    requester: ConnectionRequester<D::Stream>,
    generation_subscriber: PoolGenerationSubscriber,
    event_emitter: EventEmitter,
    _collaborators: PhantomData<fn() -> (D, H, A)>,
}

impl<D, H, A> Clone for Pool<D, H, A>
where
    D: Dialer,
    H: Handshaker<D::Stream>,
    A: Authenticator<D::Stream>,
{
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            wait_queue_timeout: self.wait_queue_timeout,
            manager: self.manager.clone(),
            requester: self.requester.clone(),
            generation_subscriber: self.generation_subscriber.clone(),
            event_emitter: self.event_emitter.clone(),
            _collaborators: PhantomData,
        }
    }
}

impl<D, H, A> std::fmt::Debug for Pool<D, H, A>
where
    D: Dialer,
    H: Handshaker<D::Stream>,
    A: Authenticator<D::Stream>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.address)
            .field("generation", &self.generation_subscriber.generation())
            .finish_non_exhaustive()
    }
}

impl<D, H, A> Pool<D, H, A>
where
    D: Dialer,
    H: Handshaker<D::Stream>,
    A: Authenticator<D::Stream>,
{
    /// Builds a pool for `address` and spawns its worker task. The pool starts PAUSED unless
    /// `options.pause_enabled` is `false`, in which case it starts READY immediately.
    pub fn new(
        address: Address,
        options: PoolOptions,
        dialer: D,
        handshaker: H,
        authenticator: A,
        credential: Option<Credential>,
    ) -> Result<Self> {
        options.validate()?;

        let event_emitter = EventEmitter::new(options.event_listener.clone(), address.clone());
        let wait_queue_timeout = options.wait_queue_timeout;

        let (manager, requester, generation_subscriber) = PoolWorker::spawn(
            address.clone(),
            &options,
            std::sync::Arc::new(dialer),
            std::sync::Arc::new(handshaker),
            std::sync::Arc::new(authenticator),
            credential,
        );

        Ok(Self {
            address,
            wait_queue_timeout,
            manager,
            requester,
            generation_subscriber,
            event_emitter,
            _collaborators: PhantomData,
        })
    }

    /// The endpoint this pool manages connections to.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The pool's current generation. Bumped every time [`Pool::clear`] runs.
    pub fn generation(&self) -> u32 {
        self.generation_subscriber.generation()
    }

    /// Checks out a connection, waiting for one to become idle or establishing a new one if
    /// the pool has room, per the design document's §4.2-§4.3. Honors `wait_queue_timeout` if
    /// configured; emits `CheckOutStarted` immediately and either `CheckedOut` or
    /// `CheckOutFailed` once the outcome is known.
    pub async fn check_out(&self) -> Result<PooledConnection<D::Stream>> {
        self.event_emitter.emit(|| {
            PoolEvent::CheckOutStarted(CheckOutStartedEvent {
                address: self.address.clone(),
            })
        });

        let start = Instant::now();
        let outcome = match self.wait_queue_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.acquire()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::wait_queue_timeout(self.address.to_string(), timeout)),
            },
            None => self.acquire().await,
        };

        match outcome {
            Ok(connection) => {
                let duration = start.elapsed();
                self.event_emitter.emit(|| {
                    PoolEvent::CheckedOut(CheckedOutEvent {
                        address: connection.address().clone(),
                        connection_id: connection.id(),
                        duration,
                    })
                });
                Ok(wrap_checked_out(connection, self.manager.clone(), self.event_emitter.clone()))
            }
            Err(error) => {
                self.event_emitter.emit(|| {
                    PoolEvent::CheckOutFailed(CheckOutFailedEvent {
                        address: self.address.clone(),
                        reason: checkout_failed_reason(&error),
                    })
                });
                Err(error)
            }
        }
    }

    /// Sends the request to the worker and awaits its reply: either a connection popped from
    /// the idle deque, or one dialed/handshaked/authenticated fresh and delivered straight from
    /// the establishment task once it finishes. A `None` reply means the worker has already
    /// exited.
    async fn acquire(&self) -> Result<crate::conn::Connection<D::Stream>> {
        match self.requester.request().await {
            None => Err(Error::pool_closed(self.address.to_string())),
            Some(ConnectionRequestResult::Unavailable(error)) => Err(error),
            Some(ConnectionRequestResult::Pooled(connection)) => Ok(*connection),
        }
    }

    /// Bumps the pool's generation, closing every idle connection and marking every checked-out
    /// connection stale so it is closed on check-in instead of reused. If `pause` is `true` and
    /// `pause_enabled` was set, the pool also transitions to PAUSED and fails every queued
    /// checkout with [`crate::error::ErrorKind::PoolPaused`]; a non-pausing clear leaves queued
    /// checkouts queued.
    pub async fn clear(&self, pause: bool) {
        self.manager.clear(pause).await;
    }

    /// Transitions a PAUSED pool back to READY. A no-op if the pool is already READY.
    pub async fn mark_ready(&self) {
        self.manager.mark_ready().await;
    }

    /// Runs one maintenance pass (idle pruning + `min_pool_size` backfill) synchronously,
    /// bypassing the internal timer. Exposed only for this crate's own tests and, under
    /// `test-util`, for integration tests outside it -- nothing at the mercy of the maintenance
    /// interval's timing should depend on this in production code.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn run_maintenance_once(&self) {
        self.manager.run_maintenance_once().await;
    }
}
