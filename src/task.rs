//! Owned threads.
//!
//! The primitives in this crate coordinate *tasks*, which are plain OS threads. [`spawn`] starts
//! one and returns a [`Task`] handle that owns it: dropping the handle joins the thread, and a
//! panic inside the thread is forwarded to whoever joins or drops the handle. No thread outlives
//! the code that started it.

use std::{
    io,
    panic::resume_unwind,
    thread::{self, JoinHandle},
};

use crate::drop::defer;

/// A builder object that can be used to configure and spawn a [`Task`].
#[derive(Clone, Default)]
pub struct TaskBuilder {
    name: Option<String>,
}

impl TaskBuilder {
    /// Creates a [`TaskBuilder`] with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the [`Task`]'s thread.
    ///
    /// Named tasks log their start and exit at `trace` level.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    /// Spawns a [`Task`] running `f` to completion.
    pub fn spawn<R, F>(self, f: F) -> io::Result<Task<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(name) = self.name.clone() {
            builder = builder.name(name);
        }
        let handle = builder.spawn(move || {
            let _guard;
            if let Some(name) = self.name {
                log::trace!("task '{name}' starting");
                _guard = defer(move || log::trace!("task '{name}' exiting"));
            }
            f()
        })?;
        Ok(Task {
            handle: Some(handle),
        })
    }
}

/// An owned thread running a closure to completion.
///
/// Created with [`spawn`] or [`TaskBuilder::spawn`].
///
/// Calling [`Task::join`] or dropping a [`Task`] joins the thread. If the thread panicked, the
/// panic is propagated to the owner.
pub struct Task<R> {
    handle: Option<JoinHandle<R>>,
}

impl<R> Drop for Task<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                if !thread::panicking() {
                    resume_unwind(payload);
                }
            }
        }
    }
}

impl<R> Task<R> {
    /// Blocks until the task has finished and returns its result.
    ///
    /// If the task panicked, the panic is propagated to the caller.
    pub fn join(mut self) -> R {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(r)) => r,
            Some(Err(payload)) => resume_unwind(payload),
            None => unreachable!("task joined twice"),
        }
    }

    /// Returns `true` if the task's closure has returned (or panicked).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Returns the underlying thread handle.
    pub fn thread(&self) -> Option<&thread::Thread> {
        self.handle.as_ref().map(JoinHandle::thread)
    }
}

/// Spawns an unnamed [`Task`].
///
/// # Panics
///
/// Panics if the operating system fails to create a thread. Use [`TaskBuilder::spawn`] to handle
/// that error instead.
pub fn spawn<R, F>(f: F) -> Task<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    Task {
        handle: Some(thread::spawn(f)),
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use crate::{test::wait_until, Channel};

    use super::*;

    fn silent_panic(payload: String) {
        resume_unwind(Box::new(payload));
    }

    #[test]
    fn join_returns_result() {
        let task = spawn(|| 40 + 2);
        assert_eq!(task.join(), 42);
    }

    #[test]
    fn named_task() {
        let task = TaskBuilder::new()
            .name("named")
            .spawn(|| thread::current().name().map(String::from))
            .unwrap();
        assert_eq!(task.thread().and_then(|t| t.name()), Some("named"));
        assert_eq!(task.join().as_deref(), Some("named"));
    }

    #[test]
    fn join_propagates_panic() {
        let task = spawn(|| silent_panic("task panic".into()));
        catch_unwind(AssertUnwindSafe(|| task.join())).unwrap_err();
    }

    #[test]
    fn drop_propagates_panic() {
        let task = spawn(|| silent_panic("task panic".into()));
        catch_unwind(AssertUnwindSafe(|| drop(task))).unwrap_err();
    }

    #[test]
    fn drop_joins() {
        let ch = Channel::bounded(1);
        let task = {
            let ch = ch.clone();
            spawn(move || ch.send(1).unwrap())
        };
        drop(task);
        assert_eq!(ch.try_recv(), Ok(1));
    }

    #[test]
    fn is_finished() {
        let gate = Channel::<()>::unbuffered();
        let task = {
            let gate = gate.clone();
            spawn(move || gate.recv())
        };
        assert!(!task.is_finished());
        gate.send(()).unwrap();
        wait_until(|| task.is_finished());
        assert_eq!(task.join(), Some(()));
    }
}
