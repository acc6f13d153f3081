//! Thread-safe subscriber registry.
//!
//! # Invariants
//!
//! 1. `notify` delivers to exactly the entries registered when its snapshot was taken, in registration order.
//!    Entries added while a round is running are not part of that round; entries removed while it is running
//!    still receive it.
//! 2. Successive notifications to the same subscriber arrive in the order `notify` was called.
//! 3. A panicking callback is isolated: it is logged and the remaining subscribers are still notified.
//! 4. An immediate value is delivered after its subscriber is registered. Ordering it against a concurrent
//!    `notify` is up to the owner of the registry.

use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::queue::DispatchQueue;
use crate::token::SubscriptionToken;

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

struct Entry<T> {
    callback: Callback<T>,
    /// `None` means the callback runs synchronously on the notifying thread.
    queue: Option<DispatchQueue>,
}

struct RegistryInner<T> {
    label: Arc<str>,
    next_id: AtomicU64,
    entries: Mutex<IndexMap<SubscriberId, Arc<Entry<T>>>>,
}

impl<T> RegistryInner<T> {
    fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.entries.lock().shift_remove(&id).is_some();
        if removed {
            trace!("Unsubscribed. registry: '{}', id: {:?}", self.label, id);
        }
        removed
    }
}

pub struct Registry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Registry<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("label", &self.inner.label)
            .field("subscriber_count", &self.len())
            .finish()
    }
}

impl<T> Registry<T> {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                label: label.into(),
                next_id: AtomicU64::new(0),
                entries: Mutex::new(IndexMap::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idempotent, returns `true` only for the call that actually removed the entry.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.remove(id)
    }
}

impl<T: Clone + Send + 'static> Registry<T> {
    /// Registers `callback` and returns a token that unsubscribes it.
    ///
    /// When `immediate` is given it is delivered to the new subscriber, and only to it, right after it is
    /// registered. Anything notified from inside that delivery reaches the new subscriber as well.
    pub fn subscribe(
        &self,
        queue: Option<DispatchQueue>,
        callback: impl Fn(&T) + Send + Sync + 'static,
        immediate: Option<T>,
    ) -> SubscriptionToken {
        let (id, token) = self.register(queue, callback);
        if let Some(value) = immediate {
            self.notify_one(id, &value);
        }
        token
    }

    pub fn register(
        &self,
        queue: Option<DispatchQueue>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> (SubscriberId, SubscriptionToken) {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(Entry {
            callback: Arc::new(callback),
            queue,
        });

        self.inner.entries.lock().insert(id, entry);
        trace!("Subscribed. registry: '{}', id: {:?}", self.inner.label, id);

        let weak: Weak<RegistryInner<T>> = Arc::downgrade(&self.inner);
        let token = SubscriptionToken::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(id);
            }
        });

        (id, token)
    }

    /// Delivers `value` to the subscriber `id` only. Returns `false` when it is no longer registered.
    pub fn notify_one(&self, id: SubscriberId, value: &T) -> bool {
        let entry = self.inner.entries.lock().get(&id).cloned();
        match entry {
            Some(entry) => {
                deliver(&self.inner.label, &entry, value);
                true
            }
            None => false,
        }
    }

    /// Delivers `value` to every subscriber present in the snapshot.
    pub fn notify(&self, value: &T) {
        // snapshot, then deliver without holding the lock so callbacks may subscribe or unsubscribe
        let snapshot: Vec<Arc<Entry<T>>> = self
            .inner
            .entries
            .lock()
            .values()
            .cloned()
            .collect();

        for entry in &snapshot {
            deliver(&self.inner.label, entry, value);
        }
    }
}

fn deliver<T: Clone + Send + 'static>(label: &Arc<str>, entry: &Arc<Entry<T>>, value: &T) {
    match &entry.queue {
        None => invoke(label, &entry.callback, value),
        Some(queue) => {
            let label = Arc::clone(label);
            let callback = Arc::clone(&entry.callback);
            let value = value.clone();
            queue.dispatch(move || invoke(&label, &callback, &value));
        }
    }
}

fn invoke<T>(label: &str, callback: &Callback<T>, value: &T) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!("Subscriber panicked, continuing with remaining subscribers. registry: '{}'", label);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    use super::*;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        (log, move |value: &T| log_clone.lock().push(value.clone()))
    }

    #[test]
    fn notifies_in_registration_order() {
        // given
        let registry = Registry::<u32>::new("order");
        let log = Arc::new(Mutex::new(Vec::new()));
        let tokens: Vec<_> = ['A', 'B', 'C']
            .into_iter()
            .map(|name| {
                let log = log.clone();
                registry.subscribe(None, move |_| log.lock().push(name), None)
            })
            .collect();

        // when
        registry.notify(&1);

        // then
        assert_eq!(*log.lock(), vec!['A', 'B', 'C']);
        drop(tokens);
        assert!(registry.is_empty());
    }

    #[test]
    fn immediate_value_only_reaches_new_subscriber() {
        // given
        let registry = Registry::<u32>::new("immediate");
        let (existing_log, existing) = recorder();
        let _existing = registry.subscribe(None, existing, None);
        let (new_log, new) = recorder();

        // when
        let _new = registry.subscribe(None, new, Some(9));

        // then
        assert_eq!(*new_log.lock(), vec![9]);
        assert!(existing_log.lock().is_empty());
    }

    #[test]
    fn notification_from_the_immediate_callback_reaches_the_new_subscriber() {
        // given
        let registry = Registry::<u32>::new("immediate-notify");
        let log = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let registry = registry.clone();
            let log = log.clone();
            move |value: &u32| {
                log.lock().push(*value);
                if *value == 0 {
                    registry.notify(&1);
                }
            }
        };

        // when
        let _token = registry.subscribe(None, callback, Some(0));

        // then
        assert_eq!(*log.lock(), vec![0, 1]);
    }

    #[test]
    fn notify_one_skips_unknown_subscribers() {
        // given
        let registry = Registry::<u32>::new("notify-one");
        let (log, callback) = recorder();
        let (id, token) = registry.register(None, callback);
        let (_other_log, other) = recorder::<u32>();
        let _other = registry.subscribe(None, other, None);

        // when
        let delivered = registry.notify_one(id, &3);
        token.release();
        let delivered_after_release = registry.notify_one(id, &4);

        // then
        assert!(delivered);
        assert!(!delivered_after_release);
        assert_eq!(*log.lock(), vec![3]);
    }

    #[test]
    fn released_token_stops_delivery() {
        // given
        let registry = Registry::<u32>::new("release");
        let (log, callback) = recorder();
        let token = registry.subscribe(None, callback, None);
        registry.notify(&1);

        // when
        token.release();
        registry.notify(&2);

        // then
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        // given
        let registry = Registry::<u32>::new("idempotent");
        let (id, token) = registry.register(None, |_| {});

        // expect
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        token.release();
        assert!(registry.is_empty());
    }

    #[test]
    fn subscribers_added_during_a_round_wait_for_the_next() {
        // given
        let registry = Registry::<u32>::new("late");
        let (late_log, late_callback) = recorder::<u32>();
        let late_callback = Arc::new(late_callback);
        let late_tokens = Arc::new(Mutex::new(Vec::new()));
        let _adder = {
            let registry = registry.clone();
            let late_tokens = late_tokens.clone();
            registry.clone().subscribe(
                None,
                move |_| {
                    let late_callback = late_callback.clone();
                    let token = registry.subscribe(None, move |value| late_callback(value), None);
                    late_tokens.lock().push(token);
                },
                None,
            )
        };

        // when
        registry.notify(&1);

        // then
        assert!(late_log.lock().is_empty());

        // when
        registry.notify(&2);

        // then
        assert_eq!(*late_log.lock(), vec![2]);
    }

    #[test]
    fn entries_removed_during_a_round_still_receive_it() {
        // given
        let registry = Registry::<u32>::new("removed");
        let (log, callback) = recorder();
        let second = Arc::new(Mutex::new(None::<SubscriptionToken>));
        let _first = {
            let second = second.clone();
            registry.subscribe(
                None,
                move |_| {
                    if let Some(token) = second.lock().take() {
                        token.release();
                    }
                },
                None,
            )
        };
        *second.lock() = Some(registry.subscribe(None, callback, None));

        // when
        registry.notify(&1);
        registry.notify(&2);

        // then
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        // given
        let registry = Registry::<u32>::new("panics");
        let _bad = registry.subscribe(None, |_| panic!("bad subscriber"), None);
        let (log, callback) = recorder();
        let _good = registry.subscribe(None, callback, None);

        // when
        registry.notify(&1);
        registry.notify(&2);

        // then
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn queued_delivery_preserves_order() {
        // given
        let registry = Registry::<u32>::new("queued");
        let queue = DispatchQueue::new("subscriber");
        let (log, callback) = recorder();
        let _token = registry.subscribe(Some(queue.clone()), callback, Some(0));

        // when
        for value in 1..=100 {
            registry.notify(&value);
        }
        queue.sync(|| ()).expect("flushed");

        // then
        assert_eq!(*log.lock(), (0..=100).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_churn_during_notify() {
        // given
        let registry = Registry::<u32>::new("churn");
        let delivered = Arc::new(AtomicUsize::new(0));
        let stable_tokens: Vec<_> = (0..4)
            .map(|_| {
                let delivered = delivered.clone();
                registry.subscribe(
                    None,
                    move |_| {
                        delivered.fetch_add(1, Ordering::SeqCst);
                    },
                    None,
                )
            })
            .collect();
        let barrier = Arc::new(Barrier::new(2));

        // when
        let churn = {
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..1_000 {
                    let token = registry.subscribe(None, |_| {}, None);
                    token.release();
                }
            })
        };
        barrier.wait();
        for value in 0..1_000 {
            registry.notify(&value);
        }
        churn.join().expect("churn thread panicked");

        // then
        assert_eq!(delivered.load(Ordering::SeqCst), 4 * 1_000);
        drop(stable_tokens);
        assert!(registry.is_empty());
    }
}
