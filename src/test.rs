//! Internal unit test utilities.

use std::{
    thread,
    time::{Duration, Instant},
};

/// Polls `cond` until it returns `true`.
///
/// Used to wait until another thread has reached a blocking point (for example, until it is
/// queued on a channel). Panics if that doesn't happen within 10 seconds, so that a broken test
/// fails instead of hanging.
#[track_caller]
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached within 10s");
        thread::sleep(Duration::from_millis(1));
    }
}
