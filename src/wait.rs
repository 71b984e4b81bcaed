//! The wait/notify primitive required by [`crate::active::ActiveRef::drain`]
//! and by the blocking consumer side of a [`crate::queue::Queue`].
//!
//! This is the hosted equivalent of the kernel's `wait_queue_head_t`: a
//! condvar paired with a placeholder mutex, used only to get the
//! happens-before edge between a state change and a waiter's recheck of its
//! predicate. The actual state being waited on (an [`ActiveRef`] count, a
//! queue's readability) lives in its own atomic outside this type.
//!
//! [`ActiveRef`]: crate::active::ActiveRef

use std::sync::{Condvar, Mutex};

/// A wait-queue: any number of threads can [`wait_while`](WaitQueue::wait_while)
/// on a predicate, and any thread can wake one or all of them once the
/// predicate may have changed.
pub struct WaitQueue {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl WaitQueue {
    #[inline]
    pub fn new() -> Self {
        WaitQueue {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Blocks the calling thread until `pred` returns `false`.
    ///
    /// `pred` may be re-evaluated spuriously; it must be cheap and free of
    /// side effects beyond reading the shared state it closes over.
    pub fn wait_while(&self, mut pred: impl FnMut() -> bool) {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .condvar
            .wait_while(guard, |()| pred())
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Wakes at most one waiter.
    ///
    /// The caller must perform the state change this wakeup announces
    /// *before* calling this, so the predicate a waiter rechecks under the
    /// lock already reflects it.
    pub fn notify_one(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.condvar.notify_one();
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.condvar.notify_all();
    }
}

impl Default for WaitQueue {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn wakes_waiter_after_state_change() {
        let waitq = Arc::new(WaitQueue::new());
        let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let waiter = {
            let waitq = Arc::clone(&waitq);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                waitq.wait_while(|| !ready.load(std::sync::atomic::Ordering::Acquire));
            })
        };

        thread::sleep(Duration::from_millis(20));
        ready.store(true, std::sync::atomic::Ordering::Release);
        waitq.notify_all();

        waiter.join().unwrap();
    }
}
