//! Channels, select, latches and once-guards for thread-based concurrency.
//!
//! (if you're looking for running large numbers of I/O tasks concurrently, you're probably better
//! served by an `async` runtime; this library is built for a modest number of OS threads that
//! communicate by passing messages)
//!
//! # Overview
//!
//! - [`Channel`] is a bounded FIFO queue shared by any number of senders and receivers. A channel
//!   with capacity 0 is a *rendezvous*: every send waits for a receiver to take the value.
//!   Channels are closed explicitly with [`Channel::close`]; receivers drain the remaining values
//!   and then observe the closure.
//! - [`Select`] waits on several send and receive operations at once and performs exactly one of
//!   them, picking fairly among the ones that are ready.
//! - [`Latch`] is a countdown latch for waiting until a group of tasks has finished.
//! - [`Once`] runs an initializer exactly once, even when called from many threads.
//! - [`spawn`] starts a [`Task`], an owned thread that is joined when its handle is dropped and
//!   that forwards its panics to the owner.
//!
//! # Usage
//!
//! A producer and a consumer connected by a rendezvous channel:
//!
//! ```
//! use conflux::{spawn, Channel};
//!
//! let (tx, rx) = Channel::unbuffered().split();
//! let producer = spawn(move || {
//!     for i in 0..3 {
//!         tx.send(i).unwrap();
//!     }
//!     tx.close().unwrap();
//! });
//!
//! let received: Vec<i32> = rx.iter().collect();
//! assert_eq!(received, [0, 1, 2]);
//! producer.join();
//! ```
//!
//! Waiting for whichever of two channels delivers first:
//!
//! ```
//! use std::time::Duration;
//! use conflux::{spawn, Channel, Select};
//!
//! let results = Channel::<u32>::bounded(1);
//! let errors = Channel::<String>::bounded(1);
//!
//! let worker = {
//!     let results = results.clone();
//!     spawn(move || results.send(42).unwrap())
//! };
//!
//! let outcome = Select::new()
//!     .recv(results.receiver(), |r| r.map(Ok))
//!     .recv(errors.receiver(), |e| e.map(Err))
//!     .wait_timeout(Duration::from_secs(10))
//!     .expect("worker did not respond");
//! assert_eq!(outcome.output, Some(Ok(42)));
//! worker.join();
//! ```

mod channel;
mod drop;
pub mod error;
mod latch;
mod once;
mod select;
mod sync;
mod task;
#[cfg(test)]
mod test;
mod waiter;

pub use channel::{Channel, ChannelBuilder, IntoIter, Iter, Receiver, Sender, TryIter};
pub use error::{
    CloseError, NegativeCounter, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError,
    TrySendError,
};
pub use latch::Latch;
pub use once::Once;
pub use select::{Select, Selected};
pub use task::{spawn, Task, TaskBuilder};

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn primitives_are_send_and_sync() {
        assert_send::<Channel<i32>>();
        assert_sync::<Channel<i32>>();
        assert_send::<Sender<String>>();
        assert_sync::<Receiver<String>>();
        assert_send::<Latch>();
        assert_sync::<Latch>();
        assert_send::<Once>();
        assert_sync::<Once>();
        assert_send::<Task<()>>();
    }
}
