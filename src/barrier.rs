//! Completion barrier for concurrently launched task-group executions.
//!
//! Each launched execution holds a [`BarrierGuard`]. The guard releases its
//! slot exactly once when dropped, whether the execution returned normally,
//! failed, was cancelled or panicked, so [`CompletionBarrier::wait`] cannot hang
//! on an execution that went away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    pending: AtomicUsize,
    released: AtomicUsize,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionBarrier {
    inner: Arc<Inner>,
}

impl CompletionBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one execution. Call before spawning it.
    pub fn arrive(&self) -> BarrierGuard {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        BarrierGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Total number of guards released so far
    pub fn release_count(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Wait until every registered guard has been released
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by one execution; dropping it releases the barrier slot
#[derive(Debug)]
pub struct BarrierGuard {
    inner: Arc<Inner>,
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}
