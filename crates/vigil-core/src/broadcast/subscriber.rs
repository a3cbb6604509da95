use std::sync::Weak;

use anyhow::Result;

use super::chunk::OutputChunk;

/// A consumer of live output.
///
/// Called synchronously from `emit`, in sequence order. An `Err` (or a
/// panic) is logged by the broadcaster and does not affect other
/// subscribers.
///
/// `on_chunk` runs while the broadcaster's dispatch lock is held. It may
/// query the broadcaster or subscribe and unsubscribe, but must not call
/// `emit` or `end_task` on the same broadcaster: that deadlocks. Forward
/// through `subscribe_channel` to react to a chunk by emitting.
pub trait Subscriber: Send + Sync {
    fn on_chunk(&self, chunk: &OutputChunk) -> Result<()>;
}

impl<F> Subscriber for F
where
    F: Fn(&OutputChunk) -> Result<()> + Send + Sync,
{
    fn on_chunk(&self, chunk: &OutputChunk) -> Result<()> {
        self(chunk)
    }
}

/// Something a [`Subscription`] can detach itself from.
pub(crate) trait Unsubscribe: Send + Sync {
    fn remove_subscriber(&self, id: u64);
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe; call
/// [`Subscription::unsubscribe`].
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    owner: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new(id: u64, owner: Weak<dyn Unsubscribe>) -> Self {
        Self { id, owner }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving chunks. A no-op if the broadcaster is gone.
    pub fn unsubscribe(self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove_subscriber(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
