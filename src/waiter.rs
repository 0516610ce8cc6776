//! Suspension records for threads blocked on channel operations.
//!
//! A blocked thread places a [`Waiter`] in the wait queue of every channel it is interested in: a
//! single channel for plain `send`/`recv`, or one channel per case for a [`Select`]. Whoever wants
//! to complete an operation on the thread's behalf (a counterpart sender or receiver, `close`, or
//! the thread itself) first has to *claim* the waiter, which atomically records the index of the
//! case being completed. Only the winner of the claim may touch the case's value slot and then
//! wake the thread; everyone else treats the queue entry as stale and discards it.
//!
//! A thread that gives up waiting (on timeout) claims its own waiter with [`ABORTED`], which
//! makes withdrawal and wakeup mutually exclusive.
//!
//! [`Select`]: crate::Select

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::sync::{Condvar, Mutex};

/// Claim value of a waiter that nobody has claimed yet.
const WAITING: usize = usize::MAX;
/// Claim value of a waiter whose thread has stopped waiting.
pub(crate) const ABORTED: usize = usize::MAX - 1;

pub(crate) struct Waiter {
    /// [`WAITING`], [`ABORTED`], or the index of the case that was completed.
    selected: AtomicUsize,
    /// Set once the claimer has finished writing the case's slot.
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Waiter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            selected: AtomicUsize::new(WAITING),
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    /// Attempts to claim the waiter for `case`.
    ///
    /// Returns `false` if the waiter was already claimed by anyone, including its own thread.
    pub(crate) fn try_claim(&self, case: usize) -> bool {
        self.selected
            .compare_exchange(WAITING, case, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` while nobody has claimed the waiter.
    pub(crate) fn is_waiting(&self) -> bool {
        self.selected.load(Ordering::Acquire) == WAITING
    }

    /// Wakes the waiting thread. Must only be called by whoever claimed the waiter.
    pub(crate) fn wake(&self) {
        *self.signaled.lock() = true;
        self.condvar.notify_one();
    }

    /// Blocks until the waiter has been claimed and woken, and returns the claimed case index.
    pub(crate) fn park(&self) -> usize {
        let signaled = self.signaled.lock();
        drop(self.condvar.wait_while(signaled, |signaled| !*signaled));
        self.selected.load(Ordering::Acquire)
    }

    /// Blocks until the waiter is woken or `deadline` passes.
    ///
    /// Returns `true` if the waiter was woken. A `false` return does not mean the waiter is
    /// unclaimed; callers withdraw by claiming it with [`ABORTED`] and fall back to [`park`] if
    /// that fails.
    ///
    /// [`park`]: Waiter::park
    pub(crate) fn park_until(&self, deadline: Instant) -> bool {
        let mut signaled = self.signaled.lock();
        loop {
            if *signaled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            signaled = self.condvar.wait_timeout(signaled, deadline - now);
        }
    }

    /// Parks until `deadline` and withdraws if nobody claimed the waiter by then.
    ///
    /// Returns the claimed case index, or `None` if the waiter was withdrawn.
    pub(crate) fn park_or_abort(&self, deadline: Instant) -> Option<usize> {
        if self.park_until(deadline) {
            return Some(self.selected.load(Ordering::Acquire));
        }
        if self.try_claim(ABORTED) {
            return None;
        }
        // Claimed concurrently with the timeout; the wakeup is imminent.
        Some(self.park())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::spawn;

    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let waiter = Waiter::new();
        assert!(waiter.is_waiting());
        assert!(waiter.try_claim(3));
        assert!(!waiter.try_claim(4));
        assert!(!waiter.try_claim(ABORTED));
        assert!(!waiter.is_waiting());
        waiter.wake();
        assert_eq!(waiter.park(), 3);
    }

    #[test]
    fn wake_from_other_thread() {
        let waiter = Waiter::new();
        let remote = waiter.clone();
        let task = spawn(move || {
            assert!(remote.try_claim(7));
            remote.wake();
        });
        assert_eq!(waiter.park(), 7);
        task.join();
    }

    #[test]
    fn abort_after_deadline() {
        let waiter = Waiter::new();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(waiter.park_or_abort(deadline), None);
        // Nobody can claim an aborted waiter.
        assert!(!waiter.try_claim(0));
    }

    #[test]
    fn claimed_before_deadline_is_not_aborted() {
        let waiter = Waiter::new();
        assert!(waiter.try_claim(1));
        waiter.wake();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(waiter.park_or_abort(deadline), Some(1));
    }
}
