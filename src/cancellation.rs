use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::Notify;

/// Error surfaced by a scan that was interrupted before finishing.
#[derive(Debug, Error)]
#[error("scan canceled")]
pub struct Cancelled;

/// Cooperative cancellation shared by everything a scan run spawns.
///
/// Cloning hands out another handle to the same token. Workers poll
/// `is_cancelled` before starting new work and race long waits against
/// `cancelled()`, so queued-but-unstarted work is abandoned while the run
/// can still finish its best-effort teardown.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled. Safe to race in a `select!`.
    pub async fn cancelled(&self) {
        loop {
            // Register before re-checking the flag: a Notified future
            // receives notify_waiters wakeups from the moment it exists.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/* ============================= TESTS ============================= */
