//! Publishes the pool's current generation so connections can cheaply read it without going
//! through the worker's request channels.

use tokio::sync::watch;

pub(crate) struct PoolGenerationPublisher {
    sender: watch::Sender<u32>,
}

impl PoolGenerationPublisher {
    pub(crate) fn publish(&self, generation: u32) {
        let _ = self.sender.send(generation);
    }
}

/// A cheap, cloneable read-only view of the pool's current generation.
#[derive(Clone, Debug)]
pub struct PoolGenerationSubscriber {
    receiver: watch::Receiver<u32>,
}

impl PoolGenerationSubscriber {
    pub(crate) fn generation(&self) -> u32 {
        *self.receiver.borrow()
    }
}

pub(crate) fn channel(initial: u32) -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = watch::channel(initial);
    (
        PoolGenerationPublisher { sender },
        PoolGenerationSubscriber { receiver },
    )
}
