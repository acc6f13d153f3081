use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

struct TokenInner {
    cleanup: Mutex<Option<Cleanup>>,
}

impl TokenInner {
    fn fire(&self) {
        // take first, so the cleanup runs without holding the lock and at most once
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Keeps a subscription alive.
///
/// The cleanup action runs exactly once: on the first [`release`](Self::release) of any clone, or when the last
/// clone is dropped. Releasing stops future deliveries; a notification already scheduled on a queue still runs.
#[derive(Clone)]
#[must_use = "dropping the token immediately unsubscribes"]
pub struct SubscriptionToken {
    inner: Arc<TokenInner>,
}

impl Debug for SubscriptionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionToken")
            .field("released", &self.is_released())
            .finish()
    }
}

impl SubscriptionToken {
    pub fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cleanup: Mutex::new(Some(Box::new(cleanup))),
            }),
        }
    }

    /// A token with nothing to clean up.
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cleanup: Mutex::new(None),
            }),
        }
    }

    pub fn release(&self) {
        self.inner.fire();
    }

    pub fn is_released(&self) -> bool {
        self.inner.cleanup.lock().is_none()
    }

    pub fn store_in(self, bag: &mut SubscriptionBag) {
        bag.insert(self);
    }
}

/// Owns tokens for as long as the subscriptions should live.
#[derive(Debug, Default)]
pub struct SubscriptionBag {
    tokens: Vec<SubscriptionToken>,
}

impl SubscriptionBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: SubscriptionToken) {
        self.tokens.push(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Releases every token, even ones that have clones elsewhere.
    pub fn clear(&mut self) {
        for token in self.tokens.drain(..) {
            token.release();
        }
    }
}

impl Drop for SubscriptionBag {
    fn drop(&mut self) {
        self.clear();
    }
}

impl Extend<SubscriptionToken> for SubscriptionBag {
    fn extend<I: IntoIterator<Item = SubscriptionToken>>(&mut self, iter: I) {
        self.tokens.extend(iter);
    }
}
