//! Deferred callback scheduling.
//!
//! The async event registry never invokes waiter callbacks inline: it hands
//! them to a [`CallbackQueue`] supplied by the caller, which runs them later
//! from its own progress context.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

/// Boxed deferred callback.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled callback, valid until it runs or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

/// A queue that runs callbacks outside the scheduling context.
pub trait CallbackQueue: Send + Sync {
    /// Enqueue `cb` and return a handle that can cancel it.
    fn schedule(&self, cb: Callback) -> CallbackId;

    /// Remove a not-yet-run callback. Returns `false` if it already ran or
    /// was never scheduled.
    fn cancel(&self, id: CallbackId) -> bool;
}

/// FIFO callback queue drained explicitly with [`ProgressQueue::progress`].
#[derive(Default)]
pub struct ProgressQueue {
    next_id: AtomicU64,
    pending: Mutex<IndexMap<u64, Callback>>,
}

impl ProgressQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, IndexMap<u64, Callback>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of callbacks waiting to run.
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every callback queued before this call, in scheduling order.
    /// Callbacks scheduled while draining run on the next call.
    ///
    /// Returns the number of callbacks run.
    pub fn progress(&self) -> usize {
        let batch: Vec<Callback> = self.pending().drain(..).map(|(_, cb)| cb).collect();
        let count = batch.len();
        for cb in batch {
            cb();
        }
        count
    }
}

impl CallbackQueue for ProgressQueue {
    fn schedule(&self, cb: Callback) -> CallbackId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending().insert(id, cb);
        CallbackId(id)
    }

    fn cancel(&self, id: CallbackId) -> bool {
        self.pending().shift_remove(&id.0).is_some()
    }
}

impl std::fmt::Debug for ProgressQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressQueue")
            .field("pending", &self.len())
            .finish()
    }
}
