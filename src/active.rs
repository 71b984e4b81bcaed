//! The active-reference lifecycle primitive.
//!
//! Grounded on `original_source/ipc/bus1/active.c`'s `bus1_active`: five
//! lifecycle states plus an unbounded acquire count are packed into a single
//! signed counter so every transition is one CAS. See the type-level docs on
//! [`ActiveRef`] for the state diagram.

use core::sync::atomic::{AtomicI32, Ordering::*};

use crate::wait::WaitQueue;

/// `BIAS` must be large enough in magnitude that `count - BIAS` never
/// overflows for any realistic number of outstanding references, and small
/// enough that negating it (some architectures implement `atomic_sub` as
/// `atomic_add(-v)`) cannot overflow either. Mirrors `BUS1_ACTIVE_BIAS`.
const BIAS: i32 = i32::MIN + 5;
const RELEASE_DIRECT: i32 = BIAS - 1;
const RELEASE: i32 = BIAS - 2;
const DRAINED: i32 = BIAS - 3;
const NEW: i32 = BIAS - 4;

static_assertions::const_assert!(NEW > i32::MIN);

/// Lifecycle misuse reported by the non-panicking `try_*` entry points.
///
/// Per the crate's error-handling design these are always programming
/// errors: the surrounding framework is expected to enforce the preconditions
/// by construction, so the panicking entry points ([`ActiveRef::activate`],
/// [`ActiveRef::deactivate`], [`ActiveRef::drain`]) `debug_assert!` them
/// instead of returning `Result`, matching `WARN_ON` in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ActiveRefError {
    #[error("active-ref was already activated")]
    AlreadyActivated,
    #[error("active-ref was not activated before this call")]
    NotActivated,
    #[error("active-ref was not deactivated before drain")]
    NotDeactivated,
    #[error("active-ref has not finished draining")]
    NotDrained,
}

/// A reference-counted lifecycle gate.
///
/// ```text
/// NEW ──activate──▶ ACTIVE(k) ──deactivate──▶ DRAINING(k) ──(k→0)──▶ RELEASE ──▶ DRAINED
///  └──────────────deactivate───────────────▶ RELEASE_DIRECT ────────▶ RELEASE ──▶ DRAINED
/// ```
///
/// No state is ever revisited once left (P1 in the crate's test suite).
/// `count` encodes all of this in one `AtomicI32`:
///
/// | State            | Value               |
/// |-------------------|--------------------|
/// | `NEW`             | sentinel            |
/// | `ACTIVE(k)`        | `0..i32::MAX`       |
/// | `DRAINING(k)`      | `BIAS..BIAS+k`       |
/// | `RELEASE_DIRECT`   | `BIAS - 1`           |
/// | `RELEASE`          | `BIAS - 2`           |
/// | `DRAINED`          | `BIAS - 3`           |
pub struct ActiveRef {
    count: AtomicI32,
}

impl ActiveRef {
    /// Creates a new gate in state `NEW`. No reference may be acquired until
    /// [`activate`](Self::activate) succeeds.
    #[inline]
    pub fn new() -> Self {
        ActiveRef {
            count: AtomicI32::new(NEW),
        }
    }

    #[inline]
    pub fn is_new(&self) -> bool {
        self.count.load(Acquire) == NEW
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.count.load(Acquire) >= 0
    }

    /// True once [`deactivate`](Self::deactivate) has taken effect. `NEW`
    /// does not count, even though it too forbids acquisition.
    #[inline]
    pub fn is_deactivated(&self) -> bool {
        let v = self.count.load(Acquire);
        v > NEW && v < 0
    }

    #[inline]
    pub fn is_drained(&self) -> bool {
        self.count.load(Acquire) == DRAINED
    }

    /// `NEW` → `ACTIVE(0)`. Returns whether this call performed the
    /// transition; idempotent calls observe `false`.
    pub fn activate(&self) -> bool {
        self.count.compare_exchange(NEW, 0, AcqRel, Acquire).is_ok()
    }

    /// Fallible wrapper over [`activate`](Self::activate) for callers that
    /// want `AlreadyActivated` reported rather than silently ignored.
    pub fn try_activate(&self) -> Result<(), ActiveRefError> {
        if self.activate() {
            Ok(())
        } else {
            Err(ActiveRefError::AlreadyActivated)
        }
    }

    /// CAS-loop equivalent of `atomic_add_unless_negative`: adds `add` to
    /// `count` as long as the current value is non-negative. Wait-free modulo
    /// contention (bounded retries, no blocking).
    fn add_unless_negative(&self, add: i32) -> bool {
        let mut cur = self.count.load(Acquire);
        loop {
            if cur < 0 {
                return false;
            }
            match self
                .count
                .compare_exchange_weak(cur, cur + add, AcqRel, Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Attempts to acquire an active reference. Wait-free. Returns `None`
    /// once the object is no longer live (deactivated or never activated) —
    /// this is the one case in this primitive's API that is a recoverable,
    /// expected outcome rather than a programming error.
    ///
    /// `waitq` is the same wait-queue a concurrent [`drain`](Self::drain) on
    /// this object waits on; the returned guard remembers it so that simply
    /// dropping the guard (rather than calling
    /// [`release`](ActiveGuard::release) explicitly) still wakes a blocked
    /// drainer.
    pub fn acquire<'a>(&'a self, waitq: &'a WaitQueue) -> Option<ActiveGuard<'a>> {
        if self.add_unless_negative(1) {
            log::trace!("active-ref acquired");
            Some(ActiveGuard {
                active: self,
                waitq,
                released: false,
            })
        } else {
            log::warn!("acquire on a deactivated (or never-activated) active-ref");
            None
        }
    }

    /// Raw decrement shared by [`ActiveGuard::release`] and its `Drop` impl.
    /// Notifies `waitq` iff this decrement is the one that brings `count`
    /// down to exactly `BIAS`, i.e. the last outstanding reference just went
    /// away and a drainer may now proceed. Every caller has a `waitq` on
    /// hand (the guard stashes the one `acquire` was given) — there is no
    /// silent-release path left that could strand a blocked `drain`.
    fn release_raw(&self, waitq: &WaitQueue) {
        let prev = self.count.fetch_sub(1, AcqRel);
        debug_assert!(prev > BIAS, "release on active-ref with no outstanding references");
        if prev - 1 == BIAS {
            log::trace!("active-ref drained to bias, waking drainer");
            waitq.notify_one();
        }
    }

    /// Initiates teardown. Idempotent: a second call is a no-op.
    ///
    /// - If never activated: `NEW` → `RELEASE_DIRECT`, recording that no
    ///   reference was ever outstanding so `drain` can skip straight to
    ///   running the release callback.
    /// - Otherwise: `count += BIAS` iff `count >= 0`, i.e. `ACTIVE(k)` →
    ///   `DRAINING(k)`. If some other thread already deactivated (count is
    ///   already negative), this does nothing.
    pub fn deactivate(&self) {
        if self
            .count
            .compare_exchange(NEW, RELEASE_DIRECT, AcqRel, Acquire)
            .is_err()
        {
            self.add_unless_negative(BIAS);
        }
        log::trace!("active-ref deactivated");
    }

    /// Waits for every outstanding active reference to be released, then
    /// runs `release_cb` exactly once (on exactly one of any number of
    /// concurrent callers) before returning. Returns `true` on the caller
    /// that ran `release_cb`.
    ///
    /// # Panics (debug builds) / undefined outcome (release builds)
    ///
    /// [`deactivate`](Self::deactivate) must have already taken effect;
    /// calling `drain` first is a programming error the crate only checks in
    /// debug builds, per its error-handling design.
    pub fn drain(&self, waitq: &WaitQueue, release_cb: impl FnOnce()) -> bool {
        debug_assert!(
            self.is_deactivated(),
            "drain() called before deactivate() took effect"
        );

        waitq.wait_while(|| self.count.load(Acquire) > BIAS);

        let won = self
            .count
            .compare_exchange(RELEASE_DIRECT, RELEASE, AcqRel, Acquire)
            .or_else(|_| self.count.compare_exchange(BIAS, RELEASE, AcqRel, Acquire))
            .is_ok();

        if won {
            release_cb();
            self.count.store(DRAINED, Release);
            log::trace!("active-ref drained and released");
            waitq.notify_all();
            true
        } else {
            log::warn!("lost the drain race, waiting for the winner to finish release");
            waitq.wait_while(|| self.count.load(Acquire) != DRAINED);
            false
        }
    }

    /// Fallible wrapper over the `NotDeactivated` precondition of
    /// [`drain`](Self::drain), for callers that would rather get a `Result`
    /// than rely on debug assertions.
    pub fn try_drain(
        &self,
        waitq: &WaitQueue,
        release_cb: impl FnOnce(),
    ) -> Result<bool, ActiveRefError> {
        if !self.is_deactivated() {
            return Err(ActiveRefError::NotDeactivated);
        }
        Ok(self.drain(waitq, release_cb))
    }

    /// Consumes the gate, asserting it has fully drained. Mirrors
    /// `bus1_active_destroy`, which is a no-op apart from this sanity check;
    /// kept as an explicit, early call site for that check in addition to
    /// the unconditional one in this type's `Drop` impl, which also catches
    /// an `ActiveRef` that is simply let go out of scope without ever being
    /// destroyed explicitly.
    pub fn destroy(self) {
        debug_assert!(self.is_drained(), "destroy() called before drain() completed");
    }
}

impl Default for ActiveRef {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveRef {
    /// Mirrors `bus1_active_destroy`'s `WARN_ON(count != DRAINED)`: an
    /// `ActiveRef` must only ever be reclaimed in state `DRAINED`
    /// (§3.1), whether or not the owner called [`destroy`](Self::destroy)
    /// explicitly first.
    fn drop(&mut self) {
        debug_assert!(
            self.is_drained(),
            "ActiveRef dropped before drain() completed"
        );
    }
}

impl core::fmt::Debug for ActiveRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActiveRef")
            .field("count", &self.count.load(Acquire))
            .finish()
    }
}

/// An outstanding active reference acquired via [`ActiveRef::acquire`].
///
/// Remembers the wait-queue it was acquired with, so dropping it (instead of
/// calling [`release`](Self::release) explicitly) still wakes a concurrent
/// [`ActiveRef::drain`] blocked on this reference going away.
pub struct ActiveGuard<'a> {
    active: &'a ActiveRef,
    waitq: &'a WaitQueue,
    released: bool,
}

impl<'a> ActiveGuard<'a> {
    /// Releases the reference and wakes a drainer if this was the last one
    /// outstanding. Equivalent to dropping the guard; spelled out for
    /// callers that want the release to happen at a specific point rather
    /// than at scope exit.
    pub fn release(mut self) {
        self.released = true;
        self.active.release_raw(self.waitq);
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.active.release_raw(self.waitq);
        }
    }
}

impl core::fmt::Debug for ActiveGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActiveGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn new_forbids_acquire() {
        let active = ActiveRef::new();
        let waitq = WaitQueue::new();
        assert!(active.is_new());
        assert!(active.acquire(&waitq).is_none());

        active.deactivate();
        active.drain(&waitq, || {});
    }

    #[test]
    fn activate_is_idempotent() {
        let active = ActiveRef::new();
        let waitq = WaitQueue::new();
        assert!(active.activate());
        assert!(!active.activate(), "second activate() must report false");
        assert_eq!(active.try_activate(), Err(ActiveRefError::AlreadyActivated));

        active.deactivate();
        active.drain(&waitq, || {});
    }

    #[test]
    fn acquire_release_round_trip() {
        let active = ActiveRef::new();
        let waitq = WaitQueue::new();
        active.activate();

        let guard = active.acquire(&waitq).expect("active object accepts acquire");
        assert!(active.is_active());
        guard.release();

        active.deactivate();
        active.drain(&waitq, || {});
    }

    #[test]
    fn deactivate_blocks_further_acquire() {
        let active = ActiveRef::new();
        let waitq = WaitQueue::new();
        active.activate();
        let guard = active.acquire(&waitq).unwrap();

        active.deactivate();
        assert!(active.is_deactivated());
        assert!(
            active.acquire(&waitq).is_none(),
            "acquire after deactivate must fail (P3)"
        );

        guard.release();
        active.drain(&waitq, || {});
    }

    #[test]
    fn drain_without_ever_activating_runs_callback_once() {
        // L1: deactivate() + drain() alone (never activated) still runs the
        // callback exactly once.
        let active = ActiveRef::new();
        let waitq = WaitQueue::new();
        active.deactivate();

        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let drained = active.drain(&waitq, move || {
            ran2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        assert!(drained);
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(active.is_drained());
        active.destroy();
    }

    #[test]
    fn activate_deactivate_drain_runs_callback_once() {
        // L1: activate() + deactivate() + drain() == deactivate() + drain()
        // in observable outcome.
        let active = ActiveRef::new();
        let waitq = WaitQueue::new();
        active.activate();
        active.deactivate();

        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let drained = active.drain(&waitq, move || {
            ran2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        assert!(drained);
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_double_drain_runs_callback_exactly_once() {
        // Scenario 6: 10 threads call drain concurrently; exactly one runs
        // the callback, the other 9 observe DRAINED and return false.
        crate::test_support::init_logging();
        let active = Arc::new(ActiveRef::new());
        let waitq = Arc::new(WaitQueue::new());
        active.activate();
        active.deactivate();

        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let winners = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let threads: Vec<_> = (0..10)
            .map(|_| {
                let active = Arc::clone(&active);
                let waitq = Arc::clone(&waitq);
                let ran = Arc::clone(&ran);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    let ran = ran;
                    let won = active.drain(&waitq, || {
                        ran.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    });
                    if won {
                        winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(winners.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn acquire_races_deactivate() {
        // Scenario 4.
        crate::test_support::init_logging();
        let active = Arc::new(ActiveRef::new());
        let waitq = Arc::new(WaitQueue::new());
        active.activate();

        let guard = active.acquire(&waitq).unwrap();
        active.deactivate();

        assert!(active.acquire(&waitq).is_none());

        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let active2 = Arc::clone(&active);
        let waitq2 = Arc::clone(&waitq);
        let drainer = thread::spawn(move || {
            active2.drain(&waitq2, move || {
                ran2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
        });

        std::thread::sleep(std::time::Duration::from_millis(10));
        guard.release();

        assert!(drainer.join().unwrap());
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_before_deactivate_is_a_programming_error() {
        let active = ActiveRef::new();
        let waitq = WaitQueue::new();
        assert_eq!(
            active.try_drain(&waitq, || {}),
            Err(ActiveRefError::NotDeactivated)
        );

        active.deactivate();
        active.drain(&waitq, || {});
    }
}
