//! Cooperative cancellation shared by the runner and every collector worker.
//!
//! Cancellation is observed at item and page boundaries and while sleeping
//! between retry attempts. It never interrupts a request that is already on
//! the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared handle to a [`Cancellation`].
pub type SharedCancellation = Arc<Cancellation>;

/// One-shot cancellation signal.
#[derive(Debug, Default)]
pub struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// Create a signal that has not fired.
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Create a new signal wrapped in [`Arc`].
    pub fn shared() -> SharedCancellation {
        Arc::new(Self::new())
    }

    /// Fire the signal. Waiters are woken exactly once.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the signal fires. Returns immediately if it already has.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel() is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
