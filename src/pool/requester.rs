//! Sender/receiver pair used for the checkout path.

use tokio::sync::{mpsc, oneshot};

use crate::{conn::Connection, error::Error, pool::handle::WorkerHandle};

/// Result of a checkout request as seen by the worker's reply.
pub(crate) enum ConnectionRequestResult<S> {
    /// A connection that was already established and simply popped from the idle deque, or
    /// one that was just dialed/handshaked/authenticated in a detached task and is reaching
    /// the caller as soon as establishment finished (see `service_checkout`'s fresh-dial
    /// branch for why the reply is sent from that task rather than from the worker loop).
    Pooled(Box<Connection<S>>),

    /// The pool was paused or closed before the request could be serviced.
    Unavailable(Error),
}

/// Cloneable handle callers use to request a connection from the pool's worker task.
///
/// Holding a `ConnectionRequester` keeps the worker alive: once every clone (and every
/// [`Pool`](crate::Pool) handle wrapping one) is dropped, the worker observes this via
/// [`WorkerHandleListener`](crate::pool::handle::WorkerHandleListener) and exits.
pub(crate) struct ConnectionRequester<S> {
    sender: mpsc::UnboundedSender<oneshot::Sender<ConnectionRequestResult<S>>>,
    _handle: WorkerHandle,
}

impl<S> Clone for ConnectionRequester<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _handle: self._handle.clone(),
        }
    }
}

impl<S> std::fmt::Debug for ConnectionRequester<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRequester").finish_non_exhaustive()
    }
}

impl<S> ConnectionRequester<S> {
    pub(crate) fn new(
        handle: WorkerHandle,
    ) -> (Self, ConnectionRequestReceiver<S>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                _handle: handle,
            },
            ConnectionRequestReceiver { receiver },
        )
    }

    /// Sends a checkout request and awaits the worker's reply. Returns `None` if the worker
    /// has already exited (pool closed).
    pub(crate) async fn request(&self) -> Option<ConnectionRequestResult<S>> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(sender).ok()?;
        receiver.await.ok()
    }
}

pub(crate) struct ConnectionRequestReceiver<S> {
    receiver: mpsc::UnboundedReceiver<oneshot::Sender<ConnectionRequestResult<S>>>,
}

impl<S> ConnectionRequestReceiver<S> {
    pub(crate) async fn recv(&mut self) -> Option<ConnectionRequest<S>> {
        self.receiver
            .recv()
            .await
            .map(|sender| ConnectionRequest { sender })
    }
}

/// A single checkout request waiting to be serviced, as seen from inside the worker.
pub(crate) struct ConnectionRequest<S> {
    sender: oneshot::Sender<ConnectionRequestResult<S>>,
}

impl<S> ConnectionRequest<S> {
    /// Attempts to fulfill the request. Returns the result back if the caller already gave up
    /// (e.g. its `wait_queue_timeout` elapsed and it dropped the receiver), so the worker can
    /// put a reused connection back rather than lose it.
    pub(crate) fn fulfill(
        self,
        result: ConnectionRequestResult<S>,
    ) -> Result<(), ConnectionRequestResult<S>> {
        self.sender.send(result)
    }
}
