//! Waiting on several channel operations at once.
//!
//! A [`Select`] is built from a list of *cases* (sends and receives, possibly on channels of
//! different element types), each with a handler, and optionally a default handler. Calling
//! [`Select::wait`] performs exactly one of the operations and runs its handler:
//!
//! - If one or more cases can complete immediately, one of them is picked uniformly at random.
//! - Otherwise, if a default handler was given, it runs instead.
//! - Otherwise the calling thread blocks until one case can complete.
//!
//! Values to send are moved into the [`Select`] when the case is added, so they are evaluated
//! exactly once and in case order, whether or not their case is chosen. Values of cases that are
//! not chosen are dropped.
//!
//! A send case on a closed channel counts as ready; its handler receives the [`SendError`]. A
//! receive case on a closed and drained channel is ready as well, and its handler receives
//! [`None`].
//!
//! ```
//! use conflux::{Channel, Select};
//!
//! let numbers = Channel::bounded(1);
//! let words = Channel::<&str>::bounded(1);
//! numbers.send(7).unwrap();
//!
//! let selected = Select::new()
//!     .recv(numbers.receiver(), |n| format!("number {n:?}"))
//!     .recv(words.receiver(), |w| format!("word {w:?}"))
//!     .wait();
//! assert_eq!(selected.index, Some(0));
//! assert_eq!(selected.output, "number Some(7)");
//! ```

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

use crate::{
    channel::{slot, Slot},
    error::{SendError, TryRecvError, TrySendError},
    waiter::{Waiter, ABORTED},
    Receiver, Sender,
};

/// One operation of a [`Select`], type-erased over the channel's element type.
trait Case<R> {
    /// Performs the operation if that's possible without blocking.
    fn try_complete(&mut self) -> bool;

    /// Queues `waiter` on the case's channel as case number `index`.
    ///
    /// Returns `false` without queueing if the operation could complete now, disregarding
    /// `waiter`'s own queue entries.
    fn register(&mut self, waiter: &Arc<Waiter>, index: usize) -> bool;

    /// Removes the entry added by [`Case::register`].
    fn withdraw(&mut self, waiter: &Arc<Waiter>, index: usize);

    /// Collects the outcome after another thread completed this case on our behalf.
    fn collect(&mut self);

    /// Runs the handler with the outcome.
    fn finish(self: Box<Self>) -> R;
}

struct RecvCase<'a, T, F> {
    receiver: &'a Receiver<T>,
    slot: Slot<T>,
    outcome: Option<Option<T>>,
    handler: F,
}

impl<'a, T, F, R> Case<R> for RecvCase<'a, T, F>
where
    F: FnOnce(Option<T>) -> R,
{
    fn try_complete(&mut self) -> bool {
        match self.receiver.shared.try_recv() {
            Ok(value) => self.outcome = Some(Some(value)),
            Err(TryRecvError::Closed) => self.outcome = Some(None),
            Err(TryRecvError::Empty) => return false,
        }
        true
    }

    fn register(&mut self, waiter: &Arc<Waiter>, index: usize) -> bool {
        self.receiver.shared.register_receiver(waiter, index, &self.slot)
    }

    fn withdraw(&mut self, waiter: &Arc<Waiter>, index: usize) {
        self.receiver.shared.withdraw_receiver(waiter, index);
    }

    fn collect(&mut self) {
        // An empty slot means the channel was closed while we were waiting.
        self.outcome = Some(self.slot.lock().take());
    }

    fn finish(self: Box<Self>) -> R {
        (self.handler)(self.outcome.flatten())
    }
}

struct SendCase<'a, T, F> {
    sender: &'a Sender<T>,
    /// The value to send, while it is not queued on the channel.
    value: Option<T>,
    bounced: Slot<T>,
    outcome: Option<Result<(), SendError<T>>>,
    handler: F,
}

impl<'a, T, F, R> Case<R> for SendCase<'a, T, F>
where
    F: FnOnce(Result<(), SendError<T>>) -> R,
{
    fn try_complete(&mut self) -> bool {
        let Some(value) = self.value.take() else {
            return false;
        };
        match self.sender.shared.try_send(value) {
            Ok(()) => self.outcome = Some(Ok(())),
            Err(TrySendError::Closed(value)) => self.outcome = Some(Err(SendError(value))),
            Err(TrySendError::Full(value)) => {
                self.value = Some(value);
                return false;
            }
        }
        true
    }

    fn register(&mut self, waiter: &Arc<Waiter>, index: usize) -> bool {
        let Some(value) = self.value.take() else {
            return true;
        };
        let shared = &self.sender.shared;
        match shared.register_sender(waiter, index, value, &self.bounced) {
            Ok(()) => true,
            Err(value) => {
                self.value = Some(value);
                false
            }
        }
    }

    fn withdraw(&mut self, waiter: &Arc<Waiter>, index: usize) {
        if self.value.is_some() {
            // Never queued.
            return;
        }
        self.value = self.sender.shared.withdraw_sender(waiter, index);
        if self.value.is_none() {
            // The entry went stale and was discarded by another thread, which bounced the value.
            self.value = self.bounced.lock().take();
        }
    }

    fn collect(&mut self) {
        // The value bounces back only if the channel was closed.
        let bounced = self.bounced.lock().take();
        self.outcome = Some(match bounced {
            None => Ok(()),
            Some(value) => Err(SendError(value)),
        });
    }

    fn finish(self: Box<Self>) -> R {
        match self.outcome {
            Some(outcome) => (self.handler)(outcome),
            None => unreachable!("finishing a send case that was never completed"),
        }
    }
}

/// The result of a [`Select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selected<R> {
    /// Index of the chosen case, in the order the cases were added, or [`None`] if the default
    /// handler ran.
    pub index: Option<usize>,
    /// Output of the handler that ran.
    pub output: R,
}

impl<R> Selected<R> {
    /// Returns `true` if no case was ready and the default handler ran.
    pub fn is_default(&self) -> bool {
        self.index.is_none()
    }
}

/// A multiplexed wait over several channel operations.
///
/// Cases are added with [`Select::recv`] and [`Select::send`]. [`Select::wait`] performs one ready
/// case, chosen uniformly at random, runs the default handler if none is ready, and otherwise
/// blocks until a case can complete.
pub struct Select<'a, R> {
    cases: Vec<Box<dyn Case<R> + 'a>>,
    default: Option<Box<dyn FnOnce() -> R + 'a>>,
}

impl<'a, R> fmt::Debug for Select<'a, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Select")
            .field("cases", &self.cases.len())
            .field("default", &self.default.is_some())
            .finish()
    }
}

impl<'a, R> Select<'a, R> {
    /// Creates an empty [`Select`].
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
        }
    }

    /// Adds a case receiving from `receiver`.
    ///
    /// `handler` is called with the received value, or with [`None`] if the channel is closed and
    /// drained.
    pub fn recv<T, F>(mut self, receiver: &'a Receiver<T>, handler: F) -> Self
    where
        T: 'a,
        F: FnOnce(Option<T>) -> R + 'a,
    {
        self.cases.push(Box::new(RecvCase {
            receiver,
            slot: slot(),
            outcome: None,
            handler,
        }));
        self
    }

    /// Adds a case sending `value` on `sender`.
    ///
    /// `handler` is called with the outcome of the send, which fails if the channel is closed.
    pub fn send<T, F>(mut self, sender: &'a Sender<T>, value: T, handler: F) -> Self
    where
        T: 'a,
        F: FnOnce(Result<(), SendError<T>>) -> R + 'a,
    {
        self.cases.push(Box::new(SendCase {
            sender,
            value: Some(value),
            bounced: slot(),
            outcome: None,
            handler,
        }));
        self
    }

    /// Sets the handler that runs if no case is ready.
    ///
    /// With a default handler, [`Select::wait`] never blocks.
    pub fn default<F>(mut self, handler: F) -> Self
    where
        F: FnOnce() -> R + 'a,
    {
        self.default = Some(Box::new(handler));
        self
    }

    /// Performs one case (or the default), blocking until that is possible.
    ///
    /// # Panics
    ///
    /// Panics if the [`Select`] has neither cases nor a default handler, since it could never
    /// complete.
    pub fn wait(self) -> Selected<R> {
        assert!(
            !self.cases.is_empty() || self.default.is_some(),
            "select with no cases and no default would block forever"
        );
        match self.run(None) {
            Some(selected) => selected,
            None => unreachable!("select without a deadline timed out"),
        }
    }

    /// Like [`Select::wait`], but returns [`None`] if no case could be performed within `timeout`.
    ///
    /// When it times out, all values of send cases are dropped.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Selected<R>> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_deadline(deadline),
            None => Some(self.wait()),
        }
    }

    /// Like [`Select::wait`], but returns [`None`] if no case could be performed by `deadline`.
    pub fn wait_deadline(self, deadline: Instant) -> Option<Selected<R>> {
        self.run(Some(deadline))
    }

    fn run(mut self, deadline: Option<Instant>) -> Option<Selected<R>> {
        let mut order: Vec<usize> = (0..self.cases.len()).collect();
        loop {
            // Visiting the cases in a uniformly random order makes the first one that completes
            // uniformly distributed over the cases that are ready.
            order.shuffle(&mut rand::thread_rng());
            let cases = &mut self.cases;
            let ready = order.iter().copied().find(|&i| cases[i].try_complete());
            if let Some(index) = ready {
                return Some(self.finish(index));
            }

            if let Some(default) = self.default.take() {
                return Some(Selected {
                    index: None,
                    output: default(),
                });
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return None;
            }

            // A case may have become ready between the attempt above and our registration on
            // its channel. Its channel then refuses the registration, and we start over.
            let waiter = Waiter::new();
            let cases = &mut self.cases;
            let all_registered = order.iter().all(|&i| cases[i].register(&waiter, i));

            let selected = if !all_registered {
                if waiter.try_claim(ABORTED) {
                    None
                } else {
                    Some(waiter.park())
                }
            } else {
                match deadline {
                    Some(deadline) => waiter.park_or_abort(deadline),
                    None => Some(waiter.park()),
                }
            };

            for (i, case) in self.cases.iter_mut().enumerate() {
                if Some(i) != selected {
                    case.withdraw(&waiter, i);
                }
            }

            if let Some(index) = selected {
                self.cases[index].collect();
                return Some(self.finish(index));
            }
        }
    }

    fn finish(mut self, index: usize) -> Selected<R> {
        let case = self.cases.swap_remove(index);
        Selected {
            index: Some(index),
            output: case.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use crate::{spawn, test::wait_until, Channel};

    use super::*;

    #[test]
    fn picks_ready_case() {
        let a = Channel::<i32>::bounded(1);
        let b = Channel::<i32>::bounded(1);
        b.send(2).unwrap();

        let selected = Select::new()
            .recv(a.receiver(), |v| v)
            .recv(b.receiver(), |v| v)
            .wait();
        assert_eq!(selected.index, Some(1));
        assert_eq!(selected.output, Some(2));
        assert!(b.is_empty());
    }

    #[test]
    fn default_runs_when_nothing_ready() {
        let a = Channel::<i32>::unbuffered();
        let selected = Select::new()
            .recv(a.receiver(), |_| "recv")
            .send(a.sender(), 1, |_| "send")
            .default(|| "default")
            .wait();
        assert!(selected.is_default());
        assert_eq!(selected.output, "default");
        assert_eq!(a.len(), 0);
    }

    #[test]
    fn values_are_evaluated_once_in_order() {
        let a = Channel::<usize>::unbuffered();
        let b = Channel::<usize>::unbuffered();
        let log = Mutex::new(Vec::new());
        let eval = |name: &'static str, value: usize| {
            log.lock().unwrap().push(name);
            value
        };

        let selected = Select::new()
            .send(a.sender(), eval("a", 2), |_| 0)
            .send(b.sender(), eval("b", 3), |_| 1)
            .default(|| 2)
            .wait();
        assert_eq!(selected.output, 2);
        assert_eq!(*log.lock().unwrap(), ["a", "b"]);
    }

    #[test]
    fn fair_between_ready_cases() {
        let a = Channel::bounded(1);
        let b = Channel::bounded(1);
        a.send(()).unwrap();
        b.send(()).unwrap();

        let mut hits = [0usize; 2];
        for _ in 0..10_000 {
            let selected = Select::new()
                .recv(a.receiver(), |_| ())
                .recv(b.receiver(), |_| ())
                .wait();
            let index = selected.index.unwrap();
            hits[index] += 1;
            // Refill the consumed channel so both cases stay ready.
            [&a, &b][index].send(()).unwrap();
        }
        for hit in hits {
            assert!((4_500..=5_500).contains(&hit), "unfair selection: {hits:?}");
        }
    }

    #[test]
    fn blocks_until_a_case_is_ready() {
        let a = Channel::<i32>::unbuffered();
        let b = Channel::<&str>::unbuffered();

        let task = {
            let b = b.clone();
            spawn(move || {
                wait_until(|| b.receiver().shared.waiting_receivers() == 1);
                b.send("late").unwrap();
            })
        };

        let selected = Select::new()
            .recv(a.receiver(), |v| format!("{v:?}"))
            .recv(b.receiver(), |v| format!("{v:?}"))
            .wait();
        assert_eq!(selected.index, Some(1));
        assert_eq!(selected.output, "Some(\"late\")");
        task.join();

        // The entry on the other channel was withdrawn.
        assert_eq!(a.receiver().shared.waiting_receivers(), 0);
    }

    #[test]
    fn blocked_send_case_is_taken() {
        let a = Channel::<i32>::unbuffered();
        let b = Channel::<i32>::unbuffered();

        let task = {
            let b = b.clone();
            spawn(move || {
                wait_until(|| b.sender().shared.waiting_senders() == 1);
                b.recv()
            })
        };

        let selected = Select::new()
            .recv(a.receiver(), |_| false)
            .send(b.sender(), 5, |res| res.is_ok())
            .wait();
        assert_eq!(selected, Selected { index: Some(1), output: true });
        assert_eq!(task.join(), Some(5));
        assert_eq!(a.receiver().shared.waiting_receivers(), 0);
    }

    #[test]
    fn close_completes_blocked_cases() {
        let a = Channel::<i32>::unbuffered();
        let b = Channel::<i32>::unbuffered();

        let task = {
            let a = a.clone();
            spawn(move || {
                wait_until(|| a.sender().shared.waiting_senders() == 1);
                a.close().unwrap();
            })
        };

        let selected = Select::new()
            .send(a.sender(), 9, |res| res.map_err(SendError::into_inner))
            .recv(b.receiver(), |_| Ok(()))
            .wait();
        assert_eq!(selected.index, Some(0));
        assert_eq!(selected.output, Err(9));
        task.join();
    }

    #[test]
    fn closed_channel_is_ready() {
        let a = Channel::<i32>::unbuffered();
        a.close().unwrap();
        let selected = Select::new()
            .recv(a.receiver(), |v| v)
            .default(|| Some(-1))
            .wait();
        assert_eq!(selected.index, Some(0));
        assert_eq!(selected.output, None);
    }

    #[test]
    fn does_not_match_itself() {
        let a = Channel::<i32>::unbuffered();
        let selected = Select::new()
            .send(a.sender(), 1, |_| "send")
            .recv(a.receiver(), |_| "recv")
            .wait_timeout(Duration::from_millis(20));
        assert_eq!(selected, None);
        assert_eq!(a.sender().shared.waiting_senders(), 0);
        assert_eq!(a.receiver().shared.waiting_receivers(), 0);
    }

    #[test]
    fn competing_selects_never_double_deliver() {
        const VALUES: usize = 2_000;
        let a = Channel::<usize>::unbuffered();
        let b = Channel::<usize>::bounded(2);
        let received = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let (a, b) = (a.clone(), b.clone());
                let (received, sum) = (received.clone(), sum.clone());
                spawn(move || loop {
                    let selected = Select::new()
                        .recv(a.receiver(), |v| v)
                        .recv(b.receiver(), |v| v)
                        .wait();
                    match selected.output {
                        Some(v) => {
                            received.fetch_add(1, Ordering::SeqCst);
                            sum.fetch_add(v, Ordering::SeqCst);
                        }
                        None => break,
                    }
                })
            })
            .collect();

        for v in 1..=VALUES {
            if v % 2 == 0 {
                a.send(v).unwrap();
            } else {
                b.send(v).unwrap();
            }
        }
        wait_until(|| received.load(Ordering::SeqCst) == VALUES);
        a.close().unwrap();
        b.close().unwrap();
        for consumer in consumers {
            consumer.join();
        }

        assert_eq!(received.load(Ordering::SeqCst), VALUES);
        assert_eq!(sum.load(Ordering::SeqCst), VALUES * (VALUES + 1) / 2);
    }

    #[test]
    fn receives_in_send_order() {
        const VALUES: u32 = 5_000;
        let ch = Channel::<u32>::bounded(4);
        let idle = Channel::<u32>::unbuffered();

        let producer = {
            let ch = ch.clone();
            spawn(move || {
                for v in 0..VALUES {
                    ch.send(v).unwrap();
                }
                ch.close().unwrap();
            })
        };

        let mut received = Vec::new();
        loop {
            let selected = Select::new()
                .recv(ch.receiver(), |v| v)
                .recv(idle.receiver(), |v| v)
                .wait();
            match selected.output {
                Some(v) => received.push(v),
                None => break,
            }
        }
        producer.join();
        assert_eq!(received, (0..VALUES).collect::<Vec<_>>());
    }

    #[test]
    fn timeout_withdraws_everything() {
        let a = Channel::<i32>::unbuffered();
        let b = Channel::<i32>::bounded(1);
        b.send(0).unwrap();

        let selected = Select::new()
            .recv(a.receiver(), |_| ())
            .send(b.sender(), 1, |_| ())
            .wait_timeout(Duration::from_millis(10));
        assert!(selected.is_none());
        assert_eq!(a.receiver().shared.waiting_receivers(), 0);
        assert_eq!(b.sender().shared.waiting_senders(), 0);
        assert_eq!(b.try_iter().collect::<Vec<_>>(), [0]);
    }

    #[test]
    #[should_panic(expected = "would block forever")]
    fn empty_select_panics() {
        Select::<()>::new().wait();
    }
}
