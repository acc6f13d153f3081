//! Read/write views over part of a store.
//!
//! A scope owns no value. Reads are `getter(parent.value())`, writes run inside the root store's update: the
//! projection is derived, the caller's body mutates it, and, if every filter accepts the result, it is merged
//! back into the parent value.
//!
//! # Invariants
//!
//! 1. A scope notifies its subscribers only when its own projection changed.
//! 2. A write rejected by a filter changes nothing and notifies nobody, at any level of the tree.
//! 3. A scope listens to its parent's child channel, which only carries the parent's own commits, so a scope
//!    never sees its own re-derivation come back to it as a parent change.

use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::change::{Change, Detector, always_detector, equality_detector};
use crate::node::{AsyncBody, DiscardedPanic, Node};
use crate::queue::DispatchQueue;
use crate::registry::{Callback, Registry};
use crate::token::SubscriptionToken;

type Getter<V, U> = Box<dyn Fn(&V) -> U + Send + Sync + 'static>;
type Merge<V, U> = Box<dyn Fn(&mut V, U) + Send + Sync + 'static>;
type Filter<U> = Box<dyn Fn(&U) -> bool + Send + Sync + 'static>;

struct Lens<V, U> {
    getter: Getter<V, U>,
    merge: Merge<V, U>,
    filters: Vec<Filter<U>>,
}

impl<V, U> Lens<V, U> {
    fn accepts(&self, local: &U) -> bool {
        self.filters.iter().all(|filter| filter(local))
    }

    /// Runs `body` on the projection of `parent_value` and merges the result back if it is accepted.
    ///
    /// Returns whether the parent should commit. A panicking body is still merged, filters permitting; when the
    /// filters reject it the panic continues as a [`DiscardedPanic`] so no level above commits either.
    fn apply(&self, parent_value: &mut V, body: impl FnOnce(&mut U) -> bool) -> bool {
        let mut local = (self.getter)(parent_value);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut local)));

        let wanted = match &outcome {
            Ok(commit) => *commit,
            Err(cause) => !cause.is::<DiscardedPanic>(),
        };
        let accepted = wanted && self.accepts(&local);
        if accepted {
            (self.merge)(parent_value, local);
        } else if wanted {
            trace!("Filter rejected write");
        }

        match outcome {
            Ok(_) => accepted,
            Err(cause) if accepted || cause.is::<DiscardedPanic>() => panic::resume_unwind(cause),
            Err(cause) => panic::resume_unwind(Box::new(DiscardedPanic(cause))),
        }
    }
}

struct ScopeNode<V, U> {
    label: Arc<str>,
    parent: Arc<dyn Node<V>>,
    lens: Arc<Lens<V, U>>,
    detect: Detector<U>,
    external: Registry<Change<U>>,
    children: Registry<Change<U>>,
    /// Subscription to the parent's child channel, released when the last handle to this scope goes away.
    _link: SubscriptionToken,
}

impl<V: Clone + Send + Sync + 'static, U: Clone + Send + Sync + 'static> ScopeNode<V, U> {
    fn propagate(&self, change: &Change<V>) {
        let projected = change.map(|value| (self.lens.getter)(value));
        if let Some(local) = (self.detect)(projected.old, projected.new) {
            trace!("Projection changed. scope: '{}'", self.label);
            self.external.notify(&local);
            self.children.notify(&local);
        }
    }
}

impl<V: Clone + Send + Sync + 'static, U: Clone + Send + Sync + 'static> Node<U> for ScopeNode<V, U> {
    fn label(&self) -> &str {
        &self.label
    }

    fn value(&self) -> U {
        (self.lens.getter)(&self.parent.value())
    }

    fn update_dyn(&self, body: &mut dyn FnMut(&mut U) -> bool) {
        self.parent
            .update_dyn(&mut |parent_value| self.lens.apply(parent_value, &mut *body));
    }

    fn update_async_dyn(self: Arc<Self>, body: AsyncBody<U>) {
        let lens = Arc::clone(&self.lens);
        Arc::clone(&self.parent).update_async_dyn(Box::new(move |parent_value: &mut V| lens.apply(parent_value, body)));
    }

    fn subscribe_dyn(
        &self,
        queue: Option<DispatchQueue>,
        notify_immediately: bool,
        callback: Callback<Change<U>>,
    ) -> SubscriptionToken {
        // no commit may be delivered between registering and reading the current value
        self.parent.exclusive(&mut || {
            let callback = Arc::clone(&callback);
            let (id, token) = self
                .external
                .register(queue.clone(), move |change| callback(change));
            if notify_immediately {
                let current = self.value();
                let immediate = Change::unchecked(current.clone(), current);
                self.parent.lead_round(&mut || {
                    self.external.notify_one(id, &immediate);
                });
            }
            token
        })
    }

    fn subscribe_children(&self, callback: Callback<Change<U>>) -> SubscriptionToken {
        self.children
            .subscribe(None, move |change| callback(change), None)
    }

    fn subscriber_count(&self) -> usize {
        self.external.len()
    }

    fn exclusive(&self, body: &mut dyn FnMut() -> SubscriptionToken) -> SubscriptionToken {
        self.parent.exclusive(body)
    }

    fn lead_round(&self, lead: &mut dyn FnMut()) {
        self.parent.lead_round(lead);
    }
}

/// A read/write view of a projection of a [`crate::Store`] or of another scope.
///
/// Cloning a `Scope` creates a new handle to the same view. Dropping the last handle detaches it from its
/// parent; scopes derived from it keep it attached for as long as they live.
pub struct Scope<U> {
    node: Arc<dyn Node<U>>,
}

impl<U> Clone for Scope<U> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<U: Debug + Clone + Send + Sync + 'static> Debug for Scope<U> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("label", &self.node.label())
            .field("value", &self.value())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl<U: Clone + Send + Sync + 'static> Scope<U> {
    pub fn label(&self) -> &str {
        self.node.label()
    }

    /// Always derived from the parent, never cached.
    pub fn value(&self) -> U {
        self.node.value()
    }

    /// Mutates the projection and merges it back into the parent, unless a filter rejects the result.
    ///
    /// A rejected write leaves every value in the tree untouched and notifies nobody; the body's result is
    /// still returned.
    pub fn update<R>(&self, body: impl FnOnce(&mut U) -> R) -> R {
        let mut body = Some(body);
        let mut result = None;
        self.node.update_dyn(&mut |local| match body.take() {
            Some(body) => {
                result = Some(body(local));
                true
            }
            None => false,
        });
        match result {
            Some(result) => result,
            None => unreachable!("update body was not run. scope: '{}'", self.node.label()),
        }
    }

    pub fn update_async(&self, body: impl FnOnce(&mut U) + Send + 'static) {
        Arc::clone(&self.node).update_async_dyn(Box::new(move |local: &mut U| {
            body(local);
            true
        }));
    }

    pub fn set(&self, value: U) {
        self.update(move |local| *local = value);
    }

    pub fn subscribe(
        &self,
        queue: Option<DispatchQueue>,
        notify_immediately: bool,
        callback: impl Fn(&Change<U>) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.node
            .subscribe_dyn(queue, notify_immediately, Arc::new(callback))
    }

    pub fn subscribe_values(
        &self,
        queue: Option<DispatchQueue>,
        notify_immediately: bool,
        callback: impl Fn(&U) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.subscribe(queue, notify_immediately, move |change| callback(&change.new))
    }

    pub fn subscriber_count(&self) -> usize {
        self.node.subscriber_count()
    }

    pub fn scope<W: Clone + PartialEq + Send + Sync + 'static>(
        &self,
        getter: impl Fn(&U) -> W + Send + Sync + 'static,
        merge: impl Fn(&mut U, W) + Send + Sync + 'static,
    ) -> Scope<W> {
        self.scope_builder(getter, merge).build()
    }

    pub fn scope_builder<W: Clone + PartialEq + Send + Sync + 'static>(
        &self,
        getter: impl Fn(&U) -> W + Send + Sync + 'static,
        merge: impl Fn(&mut U, W) + Send + Sync + 'static,
    ) -> ScopeBuilder<U, W> {
        ScopeBuilder::new(Arc::clone(&self.node), getter, merge, equality_detector())
    }

    pub fn scope_builder_unchecked<W: Clone + Send + Sync + 'static>(
        &self,
        getter: impl Fn(&U) -> W + Send + Sync + 'static,
        merge: impl Fn(&mut U, W) + Send + Sync + 'static,
    ) -> ScopeBuilder<U, W> {
        ScopeBuilder::new(Arc::clone(&self.node), getter, merge, always_detector())
    }
}

/// Configures a [`Scope`] before attaching it to its parent.
pub struct ScopeBuilder<V, U> {
    parent: Arc<dyn Node<V>>,
    lens: Lens<V, U>,
    detect: Detector<U>,
    name: Option<String>,
}

impl<V: Clone + Send + Sync + 'static, U: Clone + Send + Sync + 'static> ScopeBuilder<V, U> {
    pub(crate) fn new(
        parent: Arc<dyn Node<V>>,
        getter: impl Fn(&V) -> U + Send + Sync + 'static,
        merge: impl Fn(&mut V, U) + Send + Sync + 'static,
        detect: Detector<U>,
    ) -> Self {
        Self {
            parent,
            lens: Lens {
                getter: Box::new(getter),
                merge: Box::new(merge),
                filters: Vec::new(),
            },
            detect,
            name: None,
        }
    }

    /// Writes are only accepted when every filter returns `true`. Filters validate, they do not transform.
    pub fn filter(mut self, filter: impl Fn(&U) -> bool + Send + Sync + 'static) -> Self {
        self.lens.filters.push(Box::new(filter));
        self
    }

    /// Notify on every parent change, even when the projection did not change.
    pub fn always_notify(mut self) -> Self {
        self.detect = always_detector();
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(self) -> Scope<U> {
        let Self {
            parent,
            lens,
            detect,
            name,
        } = self;
        let label: Arc<str> = Arc::from(format!("{}/{}", parent.label(), name.as_deref().unwrap_or("scope")));
        trace!("Creating scope. scope: '{}', filters: {}", label, lens.filters.len());

        let node = Arc::new_cyclic(|weak: &Weak<ScopeNode<V, U>>| {
            let weak = weak.clone();
            let link = parent.subscribe_children(Arc::new(move |change: &Change<V>| {
                if let Some(node) = weak.upgrade() {
                    node.propagate(change);
                }
            }));

            ScopeNode {
                external: Registry::new(format!("{}/subscribers", label)),
                children: Registry::new(format!("{}/children", label)),
                label,
                parent,
                lens: Arc::new(lens),
                detect,
                _link: link,
            }
        });

        Scope {
            node,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use rstest::rstest;

    use super::*;
    use crate::Store;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Pair {
        a: i32,
        b: i32,
    }

    fn pair_scopes(store: &Store<Pair>) -> (Scope<i32>, Scope<i32>) {
        let a = store.scope(|pair| pair.a, |pair, a| pair.a = a);
        let b = store.scope(|pair| pair.b, |pair, b| pair.b = b);
        (a, b)
    }

    fn counter<T: 'static>(
        subscribe: impl FnOnce(Box<dyn Fn(&T) + Send + Sync>) -> SubscriptionToken,
    ) -> (Arc<Mutex<usize>>, SubscriptionToken) {
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        let token = subscribe(Box::new(move |_: &T| *count_clone.lock() += 1));
        (count, token)
    }

    #[test]
    fn sibling_scopes_are_isolated() {
        // given
        let store = Store::new(Pair::default());
        let (a, b) = pair_scopes(&store);
        let (root_count, _root) = counter::<Change<Pair>>(|callback| store.subscribe(None, false, move |change| callback(change)));
        let (a_count, _a) = counter::<Change<i32>>(|callback| a.subscribe(None, false, move |change| callback(change)));
        let (b_count, _b) = counter::<Change<i32>>(|callback| b.subscribe(None, false, move |change| callback(change)));

        // when
        a.update(|value| *value += 1);

        // then
        assert_eq!(*root_count.lock(), 1);
        assert_eq!(*a_count.lock(), 1);
        assert_eq!(*b_count.lock(), 0);
        assert_eq!(store.value(), Pair { a: 1, b: 0 });
        assert_eq!(a.value(), 1);
    }

    #[test]
    fn scope_sees_change_of_its_projection() {
        // given
        let store = Store::new(Pair::default());
        let (a, _b) = pair_scopes(&store);
        let log = Arc::new(Mutex::new(Vec::new()));
        let _token = {
            let log = log.clone();
            a.subscribe(None, true, move |change| log.lock().push(change.clone()))
        };

        // when
        store.update(|pair| pair.a = 7);
        store.update(|pair| pair.b = 3);

        // then
        assert_eq!(*log.lock(), vec![Change { old: 0, new: 0 }, Change { old: 0, new: 7 }]);
    }

    #[test]
    fn filter_rejection_is_a_silent_noop() {
        // given
        let store = Store::new(Pair { a: 5, b: 0 });
        let a = store
            .scope_builder(|pair| pair.a, |pair, a| pair.a = a)
            .filter(|a| *a >= 0)
            .build();
        let (root_count, _root) = counter::<Change<Pair>>(|callback| store.subscribe(None, false, move |change| callback(change)));
        let (a_count, _a) = counter::<Change<i32>>(|callback| a.subscribe(None, false, move |change| callback(change)));

        // when
        let returned = a.update(|value| {
            *value = -1;
            "ran"
        });

        // then
        assert_eq!(returned, "ran");
        assert_eq!(a.value(), 5);
        assert_eq!(store.value().a, 5);
        assert_eq!(*root_count.lock(), 0);
        assert_eq!(*a_count.lock(), 0);
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn filter_rejection_does_not_notify_an_unchecked_root() {
        // given
        let store = Store::new_unchecked(Pair::default());
        let a = store
            .scope_builder(|pair| pair.a, |pair, a| pair.a = a)
            .filter(|a| *a < 10)
            .build();

        // when
        a.set(10);

        // then
        assert_eq!(store.version(), 0);

        // when
        a.set(9);

        // then
        assert_eq!(store.version(), 1);
        assert_eq!(a.value(), 9);
    }

    #[test]
    fn scope_of_scope_propagates_to_arbitrary_depth() {
        // given
        let store = Store::new((Pair::default(), "root".to_string()));
        let pair = store.scope(|(pair, _)| pair.clone(), |(pair, _), new| *pair = new);
        let b = pair.scope(|pair| pair.b, |pair, b| pair.b = b);
        let log = Arc::new(Mutex::new(Vec::new()));
        let _token = {
            let log = log.clone();
            b.subscribe_values(None, false, move |value| log.lock().push(*value))
        };

        // when
        b.set(4);
        store.update(|(_, name)| name.push('!'));
        pair.update(|pair| pair.a = 1);
        store.update(|(pair, _)| pair.b = 2);

        // then
        assert_eq!(*log.lock(), vec![4, 2]);
        assert_eq!(store.value(), (Pair { a: 1, b: 2 }, "root!".to_string()));
    }

    #[test]
    fn nested_filters_guard_every_level() {
        // given
        let store = Store::new(Pair::default());
        let pair = store
            .scope_builder(|pair| pair.clone(), |root, pair| *root = pair)
            .filter(|pair| pair.a + pair.b <= 10)
            .build();
        let a = pair.scope(|pair| pair.a, |pair, a| pair.a = a);
        store.update(|pair| pair.b = 8);

        // when
        a.set(3);

        // then
        assert_eq!(store.value(), Pair { a: 0, b: 8 });

        // when
        a.set(2);

        // then
        assert_eq!(store.value(), Pair { a: 2, b: 8 });
    }

    #[test]
    fn dropping_the_last_handle_detaches_the_scope() {
        // given
        let store = Store::new(Pair::default());
        let (a, _b) = pair_scopes(&store);
        let a_clone = a.clone();
        let (count, token) = counter::<Change<i32>>(|callback| a.subscribe(None, false, move |change| callback(change)));

        // when
        drop(a);
        store.update(|pair| pair.a = 1);

        // then
        assert_eq!(*count.lock(), 1);

        // when
        drop(a_clone);
        store.update(|pair| pair.a = 2);

        // then
        assert_eq!(*count.lock(), 1);
        drop(token);
    }

    #[test]
    fn panicking_scope_body_keeps_accepted_partial_mutation() {
        // given
        let store = Store::new((vec![1], 0));
        let items = store.scope(|(items, _)| items.clone(), |(items, _), new| *items = new);

        // when
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            items.update(|items| {
                items.push(2);
                panic!("half way");
            })
        }));

        // then
        assert!(result.is_err());
        assert_eq!(items.value(), vec![1, 2]);
        assert_eq!(store.version(), 1);
    }

    #[rstest]
    #[case::checked(Store::new(Pair::default()))]
    #[case::unchecked(Store::new_unchecked(Pair::default()))]
    fn panicking_scope_body_with_rejected_write_commits_nothing(#[case] store: Store<Pair>) {
        // given
        let a = store
            .scope_builder(|pair| pair.a, |pair, a| pair.a = a)
            .filter(|a| *a >= 0)
            .build();
        let (root_count, _root) = counter::<Change<Pair>>(|callback| store.subscribe(None, false, move |change| callback(change)));

        // when
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            a.update(|value| {
                *value = -1;
                panic!("half way");
            })
        }));

        // then
        assert!(result.is_err());
        assert_eq!(store.value(), Pair::default());
        assert_eq!(*root_count.lock(), 0);
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn panic_from_a_rejected_nested_scope_keeps_its_payload() {
        // given
        let store = Store::new(Pair::default());
        let pair = store.scope(|pair| pair.clone(), |root, pair| *root = pair);
        let a = pair
            .scope_builder(|pair| pair.a, |pair, a| pair.a = a)
            .filter(|a| *a >= 0)
            .build();

        // when
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            a.update(|value| {
                *value = -1;
                panic!("half way");
            })
        }));

        // then
        let cause = result.expect_err("body panicked");
        assert_eq!(cause.downcast_ref::<&str>(), Some(&"half way"));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn immediate_scope_callback_update_reaches_the_new_subscriber() {
        // given
        let store = Store::new(Pair::default());
        let (a, _b) = pair_scopes(&store);
        let log = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let a = a.clone();
            let log = log.clone();
            move |value: &i32| {
                log.lock().push(*value);
                if *value == 0 {
                    a.set(5);
                }
            }
        };

        // when
        let _token = a.subscribe_values(None, true, callback);

        // then
        assert_eq!(*log.lock(), vec![0, 5]);
        assert_eq!(a.value(), 5);
    }

    #[test]
    fn async_scope_updates_apply_in_order() {
        // given
        let store = Store::new(Pair::default());
        let (a, _b) = pair_scopes(&store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _token = {
            let seen = seen.clone();
            a.subscribe_values(None, false, move |value| seen.lock().push(*value))
        };
        let (done_sender, done_receiver) = crossbeam_channel::bounded(1);

        // when
        for _ in 0..10 {
            a.update_async(|value| *value += 1);
        }
        store.update_async(move |_| {
            let _ = done_sender.send(());
        });

        // then
        done_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("async updates ran");
        assert_eq!(*seen.lock(), (1..=10).collect::<Vec<_>>());
        assert_eq!(a.value(), 10);
    }

    #[test]
    fn always_notify_scope_fires_on_unrelated_change() {
        // given
        let store = Store::new(Pair::default());
        let a = store
            .scope_builder(|pair| pair.a, |pair, a| pair.a = a)
            .always_notify()
            .named("a")
            .build();
        let (count, _token) = counter::<Change<i32>>(|callback| a.subscribe(None, false, move |change| callback(change)));

        // when
        store.update(|pair| pair.b = 1);

        // then
        assert_eq!(*count.lock(), 1);
        assert_eq!(a.label(), "store/a");
    }

    #[test]
    fn scope_callback_updating_the_root_does_not_deadlock() {
        // given
        let store = Store::new(Pair::default());
        let (a, b) = pair_scopes(&store);
        // mirror a into b
        let _mirror = {
            let b = b.clone();
            a.subscribe_values(None, false, move |value| b.set(*value))
        };

        // when
        a.set(3);

        // then
        assert_eq!(store.value(), Pair { a: 3, b: 3 });
    }
}
