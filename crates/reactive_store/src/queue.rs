//! Serial FIFO work queues.
//!
//! A [`DispatchQueue`] owns one worker thread fed by an unbounded channel. Jobs run one at a time, in the
//! order they were dispatched. Subscribers bound to a queue receive their notifications on its worker, which is
//! what gives per-subscriber delivery ordering.

use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, trace};

use crate::error::QueueError;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueInner {
    label: String,
    sender: Sender<Job>,
    worker: ThreadId,
}

/// Cloning a queue shares its worker; the worker exits after the last handle is dropped and the backlog is done.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl Debug for DispatchQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("label", &self.inner.label)
            .field("pending", &self.inner.sender.len())
            .finish()
    }
}

impl DispatchQueue {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let worker_label = label.clone();
        let handle = thread::Builder::new()
            .name(format!("queue-{}", label))
            .spawn(move || run_worker(worker_label, receiver))
            // thread creation only fails when the OS is out of resources
            .unwrap_or_else(|cause| panic!("Unable to spawn queue worker. queue: '{}', cause: {}", label, cause));

        Self {
            inner: Arc::new(QueueInner {
                worker: handle.thread().id(),
                label,
                sender,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Returns `true` when called from this queue's worker thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.worker
    }

    /// Schedules `job` to run after everything already dispatched. Never blocks.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.inner.sender.send(Box::new(job)).is_err() {
            error!("Dropping job, queue worker has exited. queue: '{}'", self.inner.label);
        }
    }

    /// Runs `job` on the queue and waits for its result.
    ///
    /// Everything dispatched before this call has finished by the time it returns, so `sync(|| ())` doubles as
    /// a flush.
    pub fn sync<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> Result<R, QueueError> {
        if self.is_current() {
            return Err(QueueError::Reentrant(self.inner.label.clone()));
        }

        let (result_sender, result_receiver) = crossbeam_channel::bounded(1);
        self.dispatch(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job));
            let _ = result_sender.send(result);
        });

        match result_receiver.recv() {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_panic)) => Err(QueueError::Panicked(self.inner.label.clone())),
            Err(_) => Err(QueueError::Disconnected(self.inner.label.clone())),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.sender.len()
    }
}

fn run_worker(label: String, receiver: Receiver<Job>) {
    trace!("Queue worker started. queue: '{}'", label);
    while let Ok(job) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job panicked, continuing with the next one. queue: '{}'", label);
        }
    }
    trace!("Queue worker stopped. queue: '{}'", label);
}
