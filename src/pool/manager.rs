//! Sender/receiver pair the worker uses to learn about checkins, clears, ready calls, and the
//! outcome of connections established outside the worker's own task.

use tokio::sync::{mpsc, oneshot};

use crate::conn::Connection;

/// A request delivered to the worker task outside of the checkout path.
pub(crate) enum ManagementRequest<S> {
    /// A previously checked-out connection is being returned.
    CheckIn(Connection<S>),

    /// Bump the generation, draining the idle deque. `pause` decides whether the pool
    /// transitions into PAUSED or stays READY.
    Clear {
        pause: bool,
        completion: oneshot::Sender<()>,
    },

    /// Transition PAUSED -> READY (idempotent if already READY).
    MarkReady { completion: oneshot::Sender<()> },

    /// Run one maintenance pass synchronously; used by tests to avoid waiting on the timer.
    Maintain { completion: oneshot::Sender<()> },

    /// A connection established to satisfy a checkout finished successfully and was delivered
    /// straight to the waiting caller by the establishment task itself; this message exists
    /// purely to true up `pending_creates` and `active_checkouts`.
    CheckoutEstablishSucceeded,

    /// A connection established to backfill `min_pool_size` finished successfully and is ready
    /// to join the idle deque (unless the pool's generation moved on while it was dialing).
    BackfillEstablishSucceeded {
        connection: Box<Connection<S>>,
        generation_at_start: u32,
    },

    /// A connection reserved via `pending_creates`, for either purpose above, failed to
    /// establish.
    EstablishFailed,
}

/// Cloneable handle used by callers (and by [`PooledConnection`](crate::conn::pooled::PooledConnection))
/// to send management requests to the worker.
pub(crate) struct PoolManager<S> {
    sender: mpsc::UnboundedSender<ManagementRequest<S>>,
}

impl<S> Clone for PoolManager<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S> std::fmt::Debug for PoolManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager").finish_non_exhaustive()
    }
}

impl<S> PoolManager<S> {
    pub(crate) fn new() -> (Self, ManagementRequestReceiver<S>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, ManagementRequestReceiver { receiver })
    }

    /// Returns the connection back to the caller if the worker has already exited, so the
    /// caller can close it and log accordingly instead of it silently vanishing.
    pub(crate) fn check_in(&self, connection: Connection<S>) -> Result<(), Connection<S>> {
        self.sender
            .send(ManagementRequest::CheckIn(connection))
            .map_err(|e| match e.0 {
                ManagementRequest::CheckIn(conn) => conn,
                _ => unreachable!("check_in always sends a CheckIn request"),
            })
    }

    pub(crate) async fn clear(&self, pause: bool) {
        let (completion, rx) = oneshot::channel();
        if self
            .sender
            .send(ManagementRequest::Clear { pause, completion })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub(crate) async fn mark_ready(&self) {
        let (completion, rx) = oneshot::channel();
        if self
            .sender
            .send(ManagementRequest::MarkReady { completion })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub(crate) async fn run_maintenance_once(&self) {
        let (completion, rx) = oneshot::channel();
        if self
            .sender
            .send(ManagementRequest::Maintain { completion })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub(crate) fn checkout_establish_succeeded(&self) {
        let _ = self.sender.send(ManagementRequest::CheckoutEstablishSucceeded);
    }

    pub(crate) fn backfill_establish_succeeded(&self, connection: Connection<S>, generation_at_start: u32) {
        let _ = self.sender.send(ManagementRequest::BackfillEstablishSucceeded {
            connection: Box::new(connection),
            generation_at_start,
        });
    }

    pub(crate) fn establish_failed(&self) {
        let _ = self.sender.send(ManagementRequest::EstablishFailed);
    }
}

pub(crate) struct ManagementRequestReceiver<S> {
    receiver: mpsc::UnboundedReceiver<ManagementRequest<S>>,
}

impl<S> ManagementRequestReceiver<S> {
    pub(crate) async fn recv(&mut self) -> Option<ManagementRequest<S>> {
        self.receiver.recv().await
    }
}
