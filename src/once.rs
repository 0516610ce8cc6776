//! One-time initialization.
//!
//! [`Once`] runs an initializer exactly once, no matter how many threads call it concurrently.
//! Threads that arrive while the initializer is running block until it has finished.
//!
//! An initializer can fail, either by returning an error from [`Once::try_call_once`] or by
//! panicking. A failed initialization does not count: the guard goes back to its initial state,
//! the failure is reported to the caller whose initializer failed, and the next caller (one of the
//! blocked threads, or a later one) runs its own initializer. A [`Once`] is never poisoned.
//!
//! Process-wide state is best modeled as an owned value that pairs a [`Once`] with the state it
//! guards, created once and passed to whoever needs it:
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::Mutex;
//! use conflux::Once;
//!
//! struct Icons {
//!     load: Once,
//!     icons: Mutex<HashMap<&'static str, &'static str>>,
//! }
//!
//! impl Icons {
//!     fn get(&self, name: &str) -> Option<&'static str> {
//!         self.load.call_once(|| {
//!             let mut icons = self.icons.lock().unwrap();
//!             icons.insert("left", "left.png");
//!             icons.insert("up", "up.png");
//!         });
//!         self.icons.lock().unwrap().get(name).copied()
//!     }
//! }
//!
//! let icons = Icons { load: Once::new(), icons: Mutex::default() };
//! assert_eq!(icons.get("left"), Some("left.png"));
//! assert_eq!(icons.get("down"), None);
//! ```

use std::{cell::Cell, convert::Infallible, fmt};

use crate::{
    drop::defer,
    sync::{Condvar, Mutex},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unstarted,
    Running,
    Done,
}

/// A guard that runs an initializer exactly once.
pub struct Once {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Once {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Once")
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Once {
    /// Creates a [`Once`] whose initializer hasn't run yet.
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State::Unstarted),
            condvar: Condvar::new(),
        }
    }

    /// Runs `init` if no initializer has completed yet.
    ///
    /// If another thread is currently running an initializer, this blocks until it is done. When
    /// this returns, an initializer has completed.
    ///
    /// If `init` panics, the panic propagates to the caller and the [`Once`] stays uninitialized.
    pub fn call_once<F: FnOnce()>(&self, init: F) {
        let res: Result<(), Infallible> = self.try_call_once(|| {
            init();
            Ok(())
        });
        match res {
            Ok(()) => {}
            Err(never) => match never {},
        }
    }

    /// Runs the fallible initializer `init` if no initializer has completed yet.
    ///
    /// Returns `Ok(())` once an initializer (this one or another caller's) has completed. If
    /// `init` itself fails, its error is returned and the [`Once`] stays uninitialized, so that a
    /// later caller can retry.
    pub fn try_call_once<F, E>(&self, init: F) -> Result<(), E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        let mut state = self.state.lock();
        loop {
            match *state {
                State::Done => return Ok(()),
                State::Running => state = self.condvar.wait(state),
                State::Unstarted => break,
            }
        }
        *state = State::Running;
        drop(state);

        log::trace!("running once initializer");
        let completed = Cell::new(false);
        // Runs on error returns and panics too, which put the guard back to `Unstarted`.
        let _finish = defer(|| {
            let next = if completed.get() {
                State::Done
            } else {
                log::debug!("once initializer failed, allowing a retry");
                State::Unstarted
            };
            *self.state.lock() = next;
            self.condvar.notify_all();
        });
        init()?;
        completed.set(true);
        Ok(())
    }

    /// Returns `true` if an initializer has completed.
    pub fn is_completed(&self) -> bool {
        *self.state.lock() == State::Done
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crate::{spawn, test::wait_until, Latch};

    use super::*;

    #[test]
    fn runs_exactly_once_across_threads() {
        let once = Arc::new(Once::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Latch::new(1));

        let callers: Vec<_> = (0..100)
            .map(|_| {
                let (once, runs, completed, start) =
                    (once.clone(), runs.clone(), completed.clone(), start.clone());
                spawn(move || {
                    start.wait().unwrap();
                    once.call_once(|| {
                        std::thread::sleep(Duration::from_millis(5));
                        runs.fetch_add(1, Ordering::SeqCst);
                    });
                    // Every caller observes the finished initialization.
                    assert!(once.is_completed());
                    assert_eq!(runs.load(Ordering::SeqCst), 1);
                    completed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        start.done().unwrap();
        for caller in callers {
            caller.join();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn done_skips_initializer() {
        let once = Once::new();
        assert!(!once.is_completed());
        once.call_once(|| {});
        assert!(once.is_completed());
        once.call_once(|| panic!("initializer ran twice"));
    }

    #[test]
    fn error_allows_retry() {
        let once = Once::new();
        assert_eq!(once.try_call_once(|| Err("unavailable")), Err("unavailable"));
        assert!(!once.is_completed());

        assert_eq!(once.try_call_once(|| Ok::<_, &str>(())), Ok(()));
        assert!(once.is_completed());
        assert_eq!(once.try_call_once(|| Err("ignored")), Ok(()));
    }

    #[test]
    fn panic_allows_retry() {
        let once = Once::new();
        catch_unwind(AssertUnwindSafe(|| once.call_once(|| panic!("initializer panicked"))))
            .unwrap_err();
        assert!(!once.is_completed());

        let mut ran = false;
        once.call_once(|| ran = true);
        assert!(ran);
        assert!(once.is_completed());
    }

    #[test]
    fn waiter_retries_after_failure() {
        let once = Arc::new(Once::new());
        let release = Arc::new(Latch::new(1));

        let failing = {
            let (once, release) = (once.clone(), release.clone());
            spawn(move || {
                once.try_call_once(|| {
                    release.wait().unwrap();
                    Err("first attempt failed")
                })
            })
        };
        wait_until(|| *once.state.lock() == State::Running);

        let waiting = {
            let once = once.clone();
            spawn(move || once.try_call_once(|| Ok::<_, &str>(())))
        };

        release.done().unwrap();
        assert_eq!(failing.join(), Err("first attempt failed"));
        assert_eq!(waiting.join(), Ok(()));
        assert!(once.is_completed());
    }
}
