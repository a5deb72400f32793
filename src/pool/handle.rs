//! A reference-counted "is anyone still using this pool" signal.
//!
//! Once every [`WorkerHandle`] is dropped, [`WorkerHandleListener::wait_for_all_handle_drops`]
//! resolves, which the worker task treats as "no more callers exist, drain and exit" -- the
//! pool's notion of `close()` without an explicit method to call.

use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _sender: mpsc::Sender<()>,
}

#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (
            WorkerHandle { _sender: sender },
            WorkerHandleListener { receiver },
        )
    }

    /// Does not resolve until every [`WorkerHandle`] clone has been dropped. Must only be
    /// polled via `select!` or a similar mechanism, never awaited on its own.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.receiver.recv().await;
    }
}
