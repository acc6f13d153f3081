//! The canonical owner of an observed value.
//!
//! # Design
//!
//! The value lives in a [`MutexBox`], which is only ever held for the instant it takes to copy a value in or
//! out. Updates are serialized by a separate re-entrant writer lock that stays held for the whole update,
//! including synchronous delivery of the resulting notifications. That gives:
//!
//! 1. Updates from any thread are totally ordered by commit.
//! 2. An update issued from inside a mutation body or a subscriber, on the thread already holding the writer
//!    lock, re-enters instead of deadlocking.
//! 3. Commits made while a notification round is being delivered are queued behind it, so every subscriber
//!    sees changes in commit order.
//!
//! No other thread can commit while the writer lock is held, so [`Store::value`] read on the updating thread
//! is always the value as committed up to that point, including commits made by the reading callback itself.
//!
//! # Failure Modes
//!
//! - **Panicking body**: whatever the body changed before panicking is committed and notified, then the panic
//!   resumes on the caller's thread. There is no rollback. A scope write rejected by a filter is discarded
//!   even when its body panicked.
//! - **Body re-entering `update`**: the nested update applies to the last committed value and commits at once.
//!   The outer body still works on the value it started from, so its result overwrites the nested commit.
//!   This is logged as a warning.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::ReentrantMutex;
use tracing::{trace, warn};

use crate::change::{Change, Detector, always_detector, equality_detector};
use crate::config::StoreConfig;
use crate::mutex_box::{LockMode, MutexBox};
use crate::node::{AsyncBody, DiscardedPanic, Node};
use crate::queue::DispatchQueue;
use crate::registry::{Callback, Registry};
use crate::scope::{Scope, ScopeBuilder};
use crate::token::SubscriptionToken;

struct WriterState<V> {
    /// Number of active `update` calls on the owning thread.
    depth: usize,
    /// Committed changes waiting for the current notification round to finish.
    backlog: VecDeque<Change<V>>,
    in_round: bool,
}

/// Clears `in_round` even if a round unwinds.
struct RoundGuard<'a, V>(&'a RefCell<WriterState<V>>);

impl<V> Drop for RoundGuard<'_, V> {
    fn drop(&mut self) {
        self.0.borrow_mut().in_round = false;
    }
}

pub(crate) struct StoreNode<V> {
    label: Arc<str>,
    storage: MutexBox<V>,
    writer: ReentrantMutex<RefCell<WriterState<V>>>,
    detect: Detector<V>,
    external: Registry<Change<V>>,
    children: Registry<Change<V>>,
    version: AtomicU64,
    async_queue: OnceLock<DispatchQueue>,
}

impl<V: Clone + Send + Sync + 'static> StoreNode<V> {
    fn new(initial: V, config: &StoreConfig, detect: Detector<V>) -> Self {
        let label: Arc<str> = Arc::from(config.label());
        Self {
            storage: MutexBox::with_label(initial, config.lock_mode, label.to_string()),
            writer: ReentrantMutex::new(RefCell::new(WriterState {
                depth: 0,
                backlog: VecDeque::new(),
                in_round: false,
            })),
            detect,
            external: Registry::new(format!("{}/subscribers", label)),
            children: Registry::new(format!("{}/children", label)),
            version: AtomicU64::new(0),
            async_queue: OnceLock::new(),
            label,
        }
    }

    fn current(&self) -> V {
        self.storage.get()
    }

    fn update<R>(&self, body: impl FnOnce(&mut V) -> R) -> R {
        self.update_gated(|value| (body(value), true))
    }

    /// Like `update`, but the body also decides whether its result is committed at all.
    fn update_gated<R>(&self, body: impl FnOnce(&mut V) -> (R, bool)) -> R {
        let writer = self.writer.lock();
        let started_at = self.version.load(Ordering::Acquire);
        let depth = {
            let mut state = writer.borrow_mut();
            state.depth += 1;
            state.depth
        };

        let mut working = self.storage.get();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body(&mut working))) {
            Ok((result, commit)) => (Ok(result), commit),
            Err(cause) => match cause.downcast::<DiscardedPanic>() {
                Ok(discarded) => {
                    warn!("Mutation body panicked and its write was rejected. store: '{}', depth: {}", self.label, depth);
                    (Err(discarded.0), false)
                }
                Err(cause) => {
                    warn!("Mutation body panicked, committing its partial result. store: '{}', depth: {}", self.label, depth);
                    (Err(cause), true)
                }
            },
        };
        let (outcome, commit) = outcome;

        if commit {
            if self.version.load(Ordering::Acquire) != started_at {
                warn!(
                    "Update nested in a mutation body is overwritten by the enclosing update. store: '{}', depth: {}",
                    self.label, depth
                );
            }

            let old = self.storage.replace(working.clone());
            if let Some(change) = (self.detect)(old, working) {
                let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
                trace!("Committed change. store: '{}', version: {}, depth: {}", self.label, version, depth);
                writer.borrow_mut().backlog.push_back(change);
                self.deliver(&writer, || ());
            }
        } else {
            trace!("Update discarded. store: '{}', depth: {}", self.label, depth);
        }

        writer.borrow_mut().depth -= 1;

        match outcome {
            Ok(result) => result,
            Err(cause) => panic::resume_unwind(cause),
        }
    }

    /// Runs `lead` as the first delivery of a notification round, then delivers queued changes in commit order.
    ///
    /// When an outer call on this thread is already delivering, `lead` runs at once and the queued changes are
    /// left to that outer round.
    fn deliver(&self, writer: &RefCell<WriterState<V>>, lead: impl FnOnce()) {
        let outer_round = std::mem::replace(&mut writer.borrow_mut().in_round, true);
        if outer_round {
            trace!("Deferring delivery until the current round completes. store: '{}'", self.label);
            lead();
            return;
        }
        let _round = RoundGuard(writer);

        lead();
        loop {
            let Some(change) = writer.borrow_mut().backlog.pop_front() else {
                break;
            };
            self.external.notify(&change);
            self.children.notify(&change);
        }
    }

    fn async_queue(&self) -> &DispatchQueue {
        self.async_queue
            .get_or_init(|| DispatchQueue::new(format!("{}-updates", self.label)))
    }

    fn subscribe(
        &self,
        queue: Option<DispatchQueue>,
        notify_immediately: bool,
        callback: impl Fn(&Change<V>) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        // no commit may be delivered between registering and the immediate notification
        let writer = self.writer.lock();
        let (id, token) = self.external.register(queue, callback);
        if notify_immediately {
            let current = self.current();
            let immediate = Change::unchecked(current.clone(), current);
            // commits made by the immediate callback reach the new subscriber too, after it returns
            self.deliver(&writer, || {
                self.external.notify_one(id, &immediate);
            });
        }
        token
    }
}

impl<V: Clone + Send + Sync + 'static> Node<V> for StoreNode<V> {
    fn label(&self) -> &str {
        &self.label
    }

    fn value(&self) -> V {
        self.current()
    }

    fn update_dyn(&self, body: &mut dyn FnMut(&mut V) -> bool) {
        self.update_gated(|value| ((), body(value)))
    }

    fn update_async_dyn(self: Arc<Self>, body: AsyncBody<V>) {
        let queue = self.async_queue().clone();
        queue.dispatch(move || self.update_gated(|value| ((), body(value))));
    }

    fn subscribe_dyn(
        &self,
        queue: Option<DispatchQueue>,
        notify_immediately: bool,
        callback: Callback<Change<V>>,
    ) -> SubscriptionToken {
        self.subscribe(queue, notify_immediately, move |change| callback(change))
    }

    fn subscribe_children(&self, callback: Callback<Change<V>>) -> SubscriptionToken {
        self.children
            .subscribe(None, move |change| callback(change), None)
    }

    fn subscriber_count(&self) -> usize {
        self.external.len()
    }

    fn exclusive(&self, body: &mut dyn FnMut() -> SubscriptionToken) -> SubscriptionToken {
        let _writer = self.writer.lock();
        body()
    }

    fn lead_round(&self, lead: &mut dyn FnMut()) {
        let writer = self.writer.lock();
        self.deliver(&writer, lead);
    }
}

/// A thread-safe observable value.
///
/// Cloning a `Store` creates a new handle to the **same** value, subscribers and scopes.
pub struct Store<V> {
    node: Arc<StoreNode<V>>,
}

impl<V> Clone for Store<V> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<V: Debug + Clone + Send + Sync + 'static> Debug for Store<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("label", &self.node.label)
            .field("value", &self.value())
            .field("version", &self.version())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl<V: Clone + PartialEq + Send + Sync + 'static> Store<V> {
    /// An exclusive-mode store that only notifies when the value actually changes.
    pub fn new(initial: V) -> Self {
        Self::with_config(initial, &StoreConfig::default())
    }

    pub fn with_config(initial: V, config: &StoreConfig) -> Self {
        Self::build(initial, config, equality_detector())
    }
}

impl<V: Clone + Send + Sync + 'static> Store<V> {
    /// For values without `PartialEq`: every update notifies, whether or not anything changed.
    pub fn new_unchecked(initial: V) -> Self {
        Self::with_config_unchecked(initial, &StoreConfig::default())
    }

    pub fn with_config_unchecked(initial: V, config: &StoreConfig) -> Self {
        Self::build(initial, config, always_detector())
    }

    fn build(initial: V, config: &StoreConfig, detect: Detector<V>) -> Self {
        trace!("Creating store. store: '{}', mode: {:?}", config.label(), config.lock_mode);
        Self {
            node: Arc::new(StoreNode::new(initial, config, detect)),
        }
    }

    pub fn label(&self) -> &str {
        &self.node.label
    }

    pub fn lock_mode(&self) -> LockMode {
        self.node.storage.mode()
    }

    /// The committed value.
    ///
    /// From inside a notification callback running on the updating thread this is the value being delivered.
    pub fn value(&self) -> V {
        self.node.current()
    }

    /// Incremented once per committed change.
    pub fn version(&self) -> u64 {
        self.node.version.load(Ordering::Acquire)
    }

    /// Mutates the value in place and notifies subscribers if it changed.
    ///
    /// Blocks while another thread is updating. Re-entrant on the updating thread.
    pub fn update<R>(&self, body: impl FnOnce(&mut V) -> R) -> R {
        self.node.update(body)
    }

    /// Like [`update`](Self::update) but returns immediately; asynchronous updates run in issue order.
    pub fn update_async(&self, body: impl FnOnce(&mut V) + Send + 'static) {
        Arc::clone(&self.node).update_async_dyn(Box::new(move |value: &mut V| {
            body(value);
            true
        }));
    }

    pub fn set(&self, value: V) {
        self.update(move |current| *current = value);
    }

    /// `notify_immediately` delivers `Change { old: current, new: current }` before any later change.
    ///
    /// Without a queue the callback runs synchronously on the updating thread.
    pub fn subscribe(
        &self,
        queue: Option<DispatchQueue>,
        notify_immediately: bool,
        callback: impl Fn(&Change<V>) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.node.subscribe(queue, notify_immediately, callback)
    }

    /// Like [`subscribe`](Self::subscribe), but only hands over the new value.
    pub fn subscribe_values(
        &self,
        queue: Option<DispatchQueue>,
        notify_immediately: bool,
        callback: impl Fn(&V) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.subscribe(queue, notify_immediately, move |change| callback(&change.new))
    }

    pub fn subscriber_count(&self) -> usize {
        self.node.external.len()
    }

    /// A read/write view of part of this store, only notified when that part changes.
    pub fn scope<U: Clone + PartialEq + Send + Sync + 'static>(
        &self,
        getter: impl Fn(&V) -> U + Send + Sync + 'static,
        merge: impl Fn(&mut V, U) + Send + Sync + 'static,
    ) -> Scope<U> {
        self.scope_builder(getter, merge).build()
    }

    pub fn scope_builder<U: Clone + PartialEq + Send + Sync + 'static>(
        &self,
        getter: impl Fn(&V) -> U + Send + Sync + 'static,
        merge: impl Fn(&mut V, U) + Send + Sync + 'static,
    ) -> ScopeBuilder<V, U> {
        ScopeBuilder::new(self.node.clone(), getter, merge, equality_detector())
    }

    pub fn scope_builder_unchecked<U: Clone + Send + Sync + 'static>(
        &self,
        getter: impl Fn(&V) -> U + Send + Sync + 'static,
        merge: impl Fn(&mut V, U) + Send + Sync + 'static,
    ) -> ScopeBuilder<V, U> {
        ScopeBuilder::new(self.node.clone(), getter, merge, always_detector())
    }
}
