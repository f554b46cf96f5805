//! Cooperative abort signal.
//!
//! Every long operation in the engine (incubation, air-pump aspiration,
//! syringe completion polling, temperature holds) waits through
//! [`AbortSignal::wait`], so raising the signal wakes all of them at once
//! instead of letting them sleep out their full duration.
//!
//! The signal is sticky: once raised it stays raised until [`AbortSignal::clear`]
//! is called, which the sequence engine does only after the aborted run has
//! fully unwound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Shared, clonable abort flag with wake-up support.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    raised: AtomicBool,
    notify: Notify,
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("raised", &self.is_raised())
            .finish()
    }
}

impl AbortSignal {
    /// Lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every pending [`wait`](Self::wait).
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True from `raise` until the next `clear`.
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Lower the signal. Waits started afterwards run to their deadline again.
    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    /// Sleep for `duration` unless the signal is raised first.
    ///
    /// Returns `true` if the wait ended because of an abort (including when the
    /// signal was already raised on entry), `false` if the full duration elapsed.
    /// A duration past the timer's range waits for the signal alone.
    pub async fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a raise in between is not lost.
        notified.as_mut().enable();

        if self.is_raised() {
            return true;
        }

        let Some(deadline) = deadline else {
            notified.await;
            return true;
        };
        tokio::select! {
            _ = &mut notified => true,
            _ = tokio::time::sleep_until(deadline) => self.is_raised(),
        }
    }
}
