//! Type-erased link between a scope and whatever it derives from.

use std::any::Any;
use std::sync::Arc;

use crate::change::Change;
use crate::queue::DispatchQueue;
use crate::registry::Callback;
use crate::token::SubscriptionToken;

/// Returns `false` to discard the update instead of committing it.
pub(crate) type AsyncBody<T> = Box<dyn FnOnce(&mut T) -> bool + Send + 'static>;

/// Panic payload wrapper for a body that panicked after its write was rejected, so nothing is committed.
pub(crate) struct DiscardedPanic(pub(crate) Box<dyn Any + Send + 'static>);

/// Implemented by the shared state behind both [`crate::Store`] and [`crate::Scope`].
pub(crate) trait Node<T>: Send + Sync {
    fn label(&self) -> &str;

    fn value(&self) -> T;

    /// Runs `body` exactly once against the value, inside the root store's update.
    ///
    /// When `body` returns `false` nothing is committed. A panicking `body` is committed as far as it got,
    /// unless it panics with a [`DiscardedPanic`].
    fn update_dyn(&self, body: &mut dyn FnMut(&mut T) -> bool);

    /// Queues `body` behind earlier asynchronous updates of the root store.
    fn update_async_dyn(self: Arc<Self>, body: AsyncBody<T>);

    fn subscribe_dyn(
        &self,
        queue: Option<DispatchQueue>,
        notify_immediately: bool,
        callback: Callback<Change<T>>,
    ) -> SubscriptionToken;

    /// The child channel: only committed changes of this node, never of a node derived from it.
    fn subscribe_children(&self, callback: Callback<Change<T>>) -> SubscriptionToken;

    fn subscriber_count(&self) -> usize;

    /// Runs `body` while holding the root store's writer lock, so no commit can be delivered meanwhile.
    fn exclusive(&self, body: &mut dyn FnMut() -> SubscriptionToken) -> SubscriptionToken;

    /// Runs `lead` as the first delivery of a notification round of the root store. Commits made by `lead`
    /// are delivered after it returns.
    fn lead_round(&self, lead: &mut dyn FnMut());
}
