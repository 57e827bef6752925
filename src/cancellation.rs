use parking_lot::{Condvar, Mutex};

use std::sync::Arc;
use std::time::Duration;

/// A cooperative cancellation signal shared between a tracer and its caller.
///
/// Cancellation is never an error: components observing the signal return
/// whatever results are available at that point. The token also doubles as an
/// interruptible sleep so the inter-cycle delay wakes immediately on cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake any sleeper.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for up to `duration`, returning early when cancelled.
    ///
    /// Returns `true` if the token was cancelled before the duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        if *cancelled {
            return true;
        }
        self.inner
            .condvar
            .wait_for(&mut cancelled, duration);
        *cancelled
    }
}
