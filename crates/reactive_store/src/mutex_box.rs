//! A value guarded by either an exclusive lock or a readers-writer lock.
//!
//! # Re-entrancy
//!
//! Calling [`MutexBox::write`] (or [`MutexBox::read`] in exclusive mode) from inside a body running on the
//! same box deadlocks. The box is deliberately not re-entrant; [`crate::Store`] layers a re-entrant writer
//! lock on top of it and never runs user code while holding the box.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::queue::DispatchQueue;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Reads and writes are serialized.
    #[default]
    Exclusive,
    /// Reads proceed concurrently, a write waits for in-flight reads and blocks new ones.
    SharedRead,
}

enum Lock<V> {
    Exclusive(Mutex<V>),
    SharedRead(RwLock<V>),
}

type PendingWrite<V> = Box<dyn FnOnce(&mut V) + Send + 'static>;

pub struct MutexBox<V> {
    lock: Lock<V>,
    /// Writes issued by `write_async`, in issue order. Only drained while the value is held exclusively.
    pending: Mutex<VecDeque<PendingWrite<V>>>,
    has_pending: AtomicBool,
    queue: OnceLock<DispatchQueue>,
    label: String,
}

impl<V: Debug> Debug for MutexBox<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("MutexBox");
        debug
            .field("label", &self.label)
            .field("mode", &self.mode());
        match &self.lock {
            Lock::Exclusive(mutex) => debug.field("value", &*mutex.lock()),
            Lock::SharedRead(rw_lock) => debug.field("value", &*rw_lock.read()),
        };
        debug.finish()
    }
}

impl<V> MutexBox<V> {
    pub fn new(value: V, mode: LockMode) -> Self {
        Self::with_label(value, mode, "mutex-box")
    }

    pub fn with_label(value: V, mode: LockMode, label: impl Into<String>) -> Self {
        let lock = match mode {
            LockMode::Exclusive => Lock::Exclusive(Mutex::new(value)),
            LockMode::SharedRead => Lock::SharedRead(RwLock::new(value)),
        };

        Self {
            lock,
            pending: Mutex::new(VecDeque::new()),
            has_pending: AtomicBool::new(false),
            queue: OnceLock::new(),
            label: label.into(),
        }
    }

    pub fn mode(&self) -> LockMode {
        match self.lock {
            Lock::Exclusive(_) => LockMode::Exclusive,
            Lock::SharedRead(_) => LockMode::SharedRead,
        }
    }

    /// Runs `body` with at least shared access.
    ///
    /// Any `write_async` issued before this call is applied first.
    pub fn read<R>(&self, body: impl FnOnce(&V) -> R) -> R {
        if self.has_pending.load(Ordering::Acquire) {
            self.write(|_| ());
        }

        match &self.lock {
            Lock::Exclusive(mutex) => body(&mutex.lock()),
            Lock::SharedRead(rw_lock) => body(&rw_lock.read()),
        }
    }

    /// Runs `body` with exclusive access.
    ///
    /// If `body` panics, whatever it already changed stays changed.
    pub fn write<R>(&self, body: impl FnOnce(&mut V) -> R) -> R {
        match &self.lock {
            Lock::Exclusive(mutex) => {
                let mut value = mutex.lock();
                self.apply_pending(&mut value);
                body(&mut value)
            }
            Lock::SharedRead(rw_lock) => {
                let mut value = rw_lock.write();
                self.apply_pending(&mut value);
                body(&mut value)
            }
        }
    }

    pub fn replace(&self, value: V) -> V {
        self.write(|current| std::mem::replace(current, value))
    }

    pub fn get(&self) -> V
    where
        V: Clone,
    {
        self.read(V::clone)
    }

    fn apply_pending(&self, value: &mut V) {
        if !self.has_pending.load(Ordering::Acquire) {
            return;
        }

        let writes: Vec<PendingWrite<V>> = {
            let mut pending = self.pending.lock();
            self.has_pending.store(false, Ordering::Release);
            pending.drain(..).collect()
        };

        trace!("Applying pending writes. box: '{}', count: {}", self.label, writes.len());
        for write in writes {
            write(value);
        }
    }
}

impl<V: Send + Sync + 'static> MutexBox<V> {
    /// Schedules `body` without blocking the caller.
    ///
    /// Pending writes are applied in issue order, either by the box's own queue or by the next `read`/`write`,
    /// whichever gets there first, so they stay totally ordered with every other write on this box.
    pub fn write_async(self: &Arc<Self>, body: impl FnOnce(&mut V) + Send + 'static) {
        {
            let mut pending = self.pending.lock();
            pending.push_back(Box::new(body));
            self.has_pending.store(true, Ordering::Release);
        }

        let this = Arc::clone(self);
        self.queue().dispatch(move || this.write(|_| ()));
    }

    fn queue(&self) -> &DispatchQueue {
        self.queue
            .get_or_init(|| DispatchQueue::new(format!("{}-writes", self.label)))
    }
}
