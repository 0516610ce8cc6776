//! Countdown latches.
//!
//! A [`Latch`] holds a counter. Work is announced by raising it with [`Latch::add`], each finished
//! piece of work lowers it with [`Latch::done`], and [`Latch::wait`] blocks until the counter
//! reaches zero.
//!
//! ```
//! use std::sync::Arc;
//! use conflux::{spawn, Latch};
//!
//! let latch = Arc::new(Latch::new(0));
//! let tasks: Vec<_> = (0..3)
//!     .map(|_| {
//!         latch.add(1).unwrap();
//!         let latch = latch.clone();
//!         spawn(move || latch.done().unwrap())
//!     })
//!     .collect();
//!
//! latch.wait().unwrap();
//! assert_eq!(latch.count(), 0);
//! # drop(tasks);
//! ```
//!
//! All `add` calls that raise the counter for a batch of work have to happen before that work can
//! finish; otherwise a waiter may be released on a transient zero.

use std::time::{Duration, Instant};

use crate::{
    error::NegativeCounter,
    sync::{Condvar, Mutex},
};

struct State {
    counter: i64,
    /// Incremented whenever the counter drops to zero, releasing everyone waiting at that time.
    releases: u64,
    /// Set when the counter was driven negative.
    poisoned: Option<NegativeCounter>,
    /// Number of threads blocked in `wait`.
    waiting: usize,
}

/// A countdown latch that releases its waiters when its counter reaches zero.
///
/// The latch is reusable: after reaching zero, it can be raised again with [`Latch::add`].
pub struct Latch {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Latch")
            .field("counter", &state.counter)
            .field("poisoned", &state.poisoned.is_some())
            .field("waiting", &state.waiting)
            .finish()
    }
}

impl Latch {
    /// Creates a latch with the given initial counter.
    ///
    /// # Panics
    ///
    /// Panics if `counter` is negative.
    pub fn new(counter: i64) -> Self {
        assert!(counter >= 0, "latch counter must not be negative");
        Self {
            state: Mutex::new(State {
                counter,
                releases: 0,
                poisoned: None,
                waiting: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Adds `delta` (which may be negative) to the counter.
    ///
    /// If the counter reaches zero, every thread currently waiting is released.
    ///
    /// If the counter would become negative, the latch is poisoned: this and every later call to
    /// [`Latch::add`] or [`Latch::wait`] fails with [`NegativeCounter`], and current waiters are
    /// released with that error.
    pub fn add(&self, delta: i64) -> Result<(), NegativeCounter> {
        let mut state = self.state.lock();
        if let Some(err) = state.poisoned {
            return Err(err);
        }

        let counter = state.counter.saturating_add(delta);
        if counter < 0 {
            let err = NegativeCounter { counter };
            state.poisoned = Some(err);
            drop(state);
            log::debug!("latch poisoned: {err}");
            self.condvar.notify_all();
            return Err(err);
        }

        state.counter = counter;
        if counter == 0 && delta != 0 {
            state.releases += 1;
            drop(state);
            log::trace!("latch released");
            self.condvar.notify_all();
        }
        Ok(())
    }

    /// Lowers the counter by one. Equivalent to `add(-1)`.
    pub fn done(&self) -> Result<(), NegativeCounter> {
        self.add(-1)
    }

    /// Blocks until the counter reaches zero.
    ///
    /// Returns immediately if it already is zero.
    pub fn wait(&self) -> Result<(), NegativeCounter> {
        let mut state = self.state.lock();
        if let Some(err) = state.poisoned {
            return Err(err);
        }
        let seen = state.releases;
        state.waiting += 1;
        let mut state = self.condvar.wait_while(state, |state| {
            state.counter != 0 && state.releases == seen && state.poisoned.is_none()
        });
        state.waiting -= 1;
        match state.poisoned {
            Some(err) if state.releases == seen => Err(err),
            _ => Ok(()),
        }
    }

    /// Like [`Latch::wait`], but gives up after `timeout`.
    ///
    /// Returns `Ok(true)` if the latch was released and `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, NegativeCounter> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait().map(|()| true);
        };

        let mut state = self.state.lock();
        if let Some(err) = state.poisoned {
            return Err(err);
        }
        let seen = state.releases;
        state.waiting += 1;
        let res = loop {
            if state.releases != seen {
                break Ok(true);
            }
            if let Some(err) = state.poisoned {
                break Err(err);
            }
            if state.counter == 0 {
                break Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                break Ok(false);
            }
            state = self.condvar.wait_timeout(state, deadline - now);
        };
        state.waiting -= 1;
        res
    }

    /// Returns the current counter value.
    pub fn count(&self) -> i64 {
        self.state.lock().counter
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.state.lock().waiting
    }
}
