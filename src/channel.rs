//! Bounded FIFO channels.
//!
//! A [`Channel`] carries values of type `T` from any number of sending threads to any number of
//! receiving threads. Its capacity is fixed when it is created; a capacity of 0 makes every send a
//! *rendezvous* that completes only when a receiver takes the value directly from the sender.
//!
//! Unlike most Rust channels, closing is explicit and happens exactly once: dropping handles never
//! closes a channel. After [`Channel::close`], sends fail, buffered values can still be received,
//! and once the buffer is drained every receive returns [`None`] without blocking.
//!
//! [`Sender`] and [`Receiver`] are direction-restricted views of a channel that can be handed to
//! code that should only ever send or only ever receive.

use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    error::{CloseError, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError, TrySendError},
    sync::{Mutex, MutexGuard},
    waiter::{Waiter, ABORTED},
};

/// A value slot shared between a blocked thread and whoever completes its operation.
pub(crate) type Slot<T> = Arc<Mutex<Option<T>>>;

pub(crate) fn slot<T>() -> Slot<T> {
    Arc::new(Mutex::new(None))
}

/// An entry in one of a channel's wait queues.
trait Entry {
    fn waiter(&self) -> &Arc<Waiter>;
    fn case(&self) -> usize;
    /// Drops an entry whose waiter was claimed by someone else.
    fn discard(self);
}

/// A blocked sender, holding the value it wants to send.
struct Sending<T> {
    waiter: Arc<Waiter>,
    case: usize,
    value: T,
    /// Receives `value` back if the send does not happen (channel closed, or entry went stale).
    bounced: Slot<T>,
}

impl<T> Entry for Sending<T> {
    fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    fn case(&self) -> usize {
        self.case
    }

    fn discard(self) {
        *self.bounced.lock() = Some(self.value);
    }
}

/// A blocked receiver, with the slot the received value is placed in.
struct Receiving<T> {
    waiter: Arc<Waiter>,
    case: usize,
    slot: Slot<T>,
}

impl<T> Entry for Receiving<T> {
    fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    fn case(&self) -> usize {
        self.case
    }

    fn discard(self) {}
}

/// Pops entries until one can be claimed. Stale entries are discarded on the way.
fn claim<E: Entry>(queue: &mut VecDeque<E>) -> Option<E> {
    while let Some(entry) = queue.pop_front() {
        if entry.waiter().try_claim(entry.case()) {
            return Some(entry);
        }
        entry.discard();
    }
    None
}

/// Whether `queue` holds an unclaimed entry that doesn't belong to `me`.
fn has_counterpart<E: Entry>(queue: &VecDeque<E>, me: &Arc<Waiter>) -> bool {
    queue
        .iter()
        .any(|e| !Arc::ptr_eq(e.waiter(), me) && e.waiter().is_waiting())
}

fn remove<E: Entry>(queue: &mut VecDeque<E>, me: &Arc<Waiter>, case: usize) -> Option<E> {
    let pos = queue
        .iter()
        .position(|e| Arc::ptr_eq(e.waiter(), me) && e.case() == case)?;
    queue.remove(pos)
}

struct State<T> {
    buffer: VecDeque<T>,
    closed: bool,
    senders: VecDeque<Sending<T>>,
    receivers: VecDeque<Receiving<T>>,
}

impl<T> State<T> {
    fn try_send(&mut self, capacity: usize, value: T) -> Result<(), TrySendError<T>> {
        if self.closed {
            return Err(TrySendError::Closed(value));
        }
        if let Some(receiving) = claim(&mut self.receivers) {
            *receiving.slot.lock() = Some(value);
            receiving.waiter.wake();
            return Ok(());
        }
        if self.buffer.len() < capacity {
            self.buffer.push_back(value);
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }

    fn try_recv(&mut self) -> Result<T, TryRecvError> {
        if let Some(value) = self.buffer.pop_front() {
            // Senders only wait while the buffer is full, so the oldest one moves into the
            // space that was just freed.
            if let Some(sending) = claim(&mut self.senders) {
                self.buffer.push_back(sending.value);
                sending.waiter.wake();
            }
            return Ok(value);
        }
        if let Some(sending) = claim(&mut self.senders) {
            sending.waiter.wake();
            return Ok(sending.value);
        }
        if self.closed {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Whether a send could complete right now without blocking, ignoring `me`'s own entries.
    fn send_ready_for(&self, capacity: usize, me: &Arc<Waiter>) -> bool {
        self.closed || self.buffer.len() < capacity || has_counterpart(&self.receivers, me)
    }

    /// Whether a receive could complete right now without blocking, ignoring `me`'s own entries.
    fn recv_ready_for(&self, me: &Arc<Waiter>) -> bool {
        self.closed || !self.buffer.is_empty() || has_counterpart(&self.senders, me)
    }

    fn close(&mut self) -> Result<(), CloseError> {
        if self.closed {
            return Err(CloseError { _priv: () });
        }
        self.closed = true;
        while let Some(sending) = claim(&mut self.senders) {
            *sending.bounced.lock() = Some(sending.value);
            sending.waiter.wake();
        }
        while let Some(receiving) = claim(&mut self.receivers) {
            receiving.waiter.wake();
        }
        Ok(())
    }
}

pub(crate) struct Shared<T> {
    name: Option<String>,
    capacity: usize,
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn new(name: Option<String>, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            state: Mutex::new(State {
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock()
    }

    pub(crate) fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.lock().try_send(self.capacity, value)
    }

    pub(crate) fn try_recv(&self) -> Result<T, TryRecvError> {
        self.lock().try_recv()
    }

    fn send(&self, value: T) -> Result<(), SendError<T>> {
        let (waiter, bounced) = match self.enqueue_sender(value) {
            Ok(None) => return Ok(()),
            Ok(Some(registration)) => registration,
            Err(value) => return Err(SendError(value)),
        };
        waiter.park();
        let bounced = bounced.lock().take();
        match bounced {
            None => Ok(()),
            Some(value) => Err(SendError(value)),
        }
    }

    fn send_deadline(&self, value: T, deadline: Instant) -> Result<(), SendTimeoutError<T>> {
        let (waiter, bounced) = match self.enqueue_sender(value) {
            Ok(None) => return Ok(()),
            Ok(Some(registration)) => registration,
            Err(value) => return Err(SendTimeoutError::Closed(value)),
        };
        if !waiter.park_until(deadline) {
            // Abort under the channel lock, so that the entry (and our value) is still queued.
            let mut state = self.lock();
            if waiter.try_claim(ABORTED) {
                return match remove(&mut state.senders, &waiter, 0) {
                    Some(sending) => Err(SendTimeoutError::Timeout(sending.value)),
                    None => unreachable!("aborted sender is missing from the wait queue"),
                };
            }
            drop(state);
            waiter.park();
        }
        let bounced = bounced.lock().take();
        match bounced {
            None => Ok(()),
            Some(value) => Err(SendTimeoutError::Closed(value)),
        }
    }

    /// Completes the send immediately if possible, or queues a blocked sender.
    ///
    /// Returns `Err` with the value if the channel is closed.
    #[allow(clippy::type_complexity)]
    fn enqueue_sender(&self, value: T) -> Result<Option<(Arc<Waiter>, Slot<T>)>, T> {
        let mut state = self.lock();
        let value = match state.try_send(self.capacity, value) {
            Ok(()) => return Ok(None),
            Err(TrySendError::Closed(value)) => return Err(value),
            Err(TrySendError::Full(value)) => value,
        };
        let waiter = Waiter::new();
        let bounced = slot();
        state.senders.push_back(Sending {
            waiter: waiter.clone(),
            case: 0,
            value,
            bounced: bounced.clone(),
        });
        Ok(Some((waiter, bounced)))
    }

    fn recv(&self) -> Option<T> {
        let (waiter, slot) = match self.enqueue_receiver() {
            Ok(value) => return value,
            Err(registration) => registration,
        };
        waiter.park();
        let value = slot.lock().take();
        value
    }

    fn recv_deadline(&self, deadline: Instant) -> Result<T, RecvTimeoutError> {
        let (waiter, slot) = match self.enqueue_receiver() {
            Ok(value) => return value.ok_or(RecvTimeoutError::Closed),
            Err(registration) => registration,
        };
        match waiter.park_or_abort(deadline) {
            Some(_) => {
                let value = slot.lock().take();
                value.ok_or(RecvTimeoutError::Closed)
            }
            None => {
                self.lock().receivers.retain(|r| !Arc::ptr_eq(&r.waiter, &waiter));
                Err(RecvTimeoutError::Timeout)
            }
        }
    }

    /// Completes the receive immediately if possible (`Ok`), or queues a blocked receiver.
    fn enqueue_receiver(&self) -> Result<Option<T>, (Arc<Waiter>, Slot<T>)> {
        let mut state = self.lock();
        match state.try_recv() {
            Ok(value) => return Ok(Some(value)),
            Err(TryRecvError::Closed) => return Ok(None),
            Err(TryRecvError::Empty) => {}
        }
        let waiter = Waiter::new();
        let slot = slot();
        state.receivers.push_back(Receiving {
            waiter: waiter.clone(),
            case: 0,
            slot: slot.clone(),
        });
        Err((waiter, slot))
    }

    fn close(&self) -> Result<(), CloseError> {
        let res = self.lock().close();
        match (&res, &self.name) {
            (Ok(()), Some(name)) => log::trace!("channel '{name}' closed"),
            (Err(_), Some(name)) => log::debug!("channel '{name}' closed twice"),
            _ => {}
        }
        res
    }

    /// Queues a blocked sender on behalf of a select case.
    ///
    /// If the send could complete right now, nothing is queued and the value is returned. Senders
    /// are only ever queued behind a full buffer, which keeps the buffer ahead of them in order.
    pub(crate) fn register_sender(
        &self,
        waiter: &Arc<Waiter>,
        case: usize,
        value: T,
        bounced: &Slot<T>,
    ) -> Result<(), T> {
        let mut state = self.lock();
        if state.send_ready_for(self.capacity, waiter) {
            return Err(value);
        }
        state.senders.push_back(Sending {
            waiter: waiter.clone(),
            case,
            value,
            bounced: bounced.clone(),
        });
        Ok(())
    }

    /// Queues a blocked receiver on behalf of a select case.
    ///
    /// Returns `false` without queueing anything if the receive could complete right now. A
    /// receiver queued next to buffered values would be handed newer values ahead of them.
    pub(crate) fn register_receiver(
        &self,
        waiter: &Arc<Waiter>,
        case: usize,
        slot: &Slot<T>,
    ) -> bool {
        let mut state = self.lock();
        if state.recv_ready_for(waiter) {
            return false;
        }
        state.receivers.push_back(Receiving {
            waiter: waiter.clone(),
            case,
            slot: slot.clone(),
        });
        true
    }

    /// Removes a select case's sender entry, returning its value if the entry was still queued.
    pub(crate) fn withdraw_sender(&self, waiter: &Arc<Waiter>, case: usize) -> Option<T> {
        remove(&mut self.lock().senders, waiter, case).map(|sending| sending.value)
    }

    pub(crate) fn withdraw_receiver(&self, waiter: &Arc<Waiter>, case: usize) {
        remove(&mut self.lock().receivers, waiter, case);
    }

    fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn waiting_senders(&self) -> usize {
        self.lock().senders.len()
    }

    #[cfg(test)]
    pub(crate) fn waiting_receivers(&self) -> usize {
        self.lock().receivers.len()
    }
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// A builder object that can be used to configure and create a [`Channel`].
#[derive(Clone, Default)]
pub struct ChannelBuilder {
    name: Option<String>,
    capacity: usize,
}

impl ChannelBuilder {
    /// Sets the name of the [`Channel`], which is included in its log output.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the number of values the [`Channel`] can buffer.
    ///
    /// By default, a capacity of 0 is used, which means that every send blocks until a receiver
    /// takes the value.
    #[inline]
    pub fn capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Creates the configured [`Channel`].
    pub fn build<T>(self) -> Channel<T> {
        Channel::from_shared(Arc::new(Shared::new(self.name, self.capacity)))
    }
}

/// A bounded, closable, multi-producer multi-consumer FIFO channel.
///
/// Cloning a [`Channel`] yields another handle to the *same* channel.
pub struct Channel<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.sender.shared;
        f.debug_struct("Channel")
            .field("name", &shared.name)
            .field("capacity", &shared.capacity)
            .field("len", &shared.len())
            .field("closed", &shared.is_closed())
            .finish_non_exhaustive()
    }
}

impl Channel<()> {
    /// Returns a builder that can be used to configure and create a [`Channel`].
    #[inline]
    pub fn builder() -> ChannelBuilder {
        ChannelBuilder::default()
    }
}

impl<T> Channel<T> {
    fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self {
            sender: Sender {
                shared: shared.clone(),
            },
            receiver: Receiver { shared },
        }
    }

    /// Creates a channel that buffers up to `capacity` values.
    pub fn bounded(capacity: usize) -> Self {
        Channel::builder().capacity(capacity).build()
    }

    /// Creates a rendezvous channel (capacity 0).
    pub fn unbuffered() -> Self {
        Self::bounded(0)
    }

    /// Returns the send-only view of this channel.
    #[inline]
    pub fn sender(&self) -> &Sender<T> {
        &self.sender
    }

    /// Returns the receive-only view of this channel.
    #[inline]
    pub fn receiver(&self) -> &Receiver<T> {
        &self.receiver
    }

    /// Splits the channel into owned send-only and receive-only handles.
    pub fn split(self) -> (Sender<T>, Receiver<T>) {
        (self.sender, self.receiver)
    }

    /// Sends a value, blocking while the buffer is full and no receiver is waiting.
    ///
    /// Fails with the value if the channel is closed, either before the call or while the caller
    /// is blocked.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.sender.send(value)
    }

    /// Sends a value if that is possible without blocking.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.sender.try_send(value)
    }

    /// Like [`Channel::send`], but gives up (returning the value) after `timeout`.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        self.sender.send_timeout(value, timeout)
    }

    /// Receives the oldest value, blocking while the channel is empty and open.
    ///
    /// Returns [`None`] once the channel is closed and drained, without blocking.
    pub fn recv(&self) -> Option<T> {
        self.receiver.recv()
    }

    /// Receives a value, returning `(T::default(), false)` once closed and drained.
    pub fn recv_ok(&self) -> (T, bool)
    where
        T: Default,
    {
        self.receiver.recv_ok()
    }

    /// Receives a value if that is possible without blocking.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Like [`Channel::recv`], but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Closes the channel.
    ///
    /// Every blocked sender fails with its value, every blocked receiver gets [`None`]. Values
    /// already in the buffer can still be received.
    ///
    /// Closing a channel twice is an error.
    pub fn close(&self) -> Result<(), CloseError> {
        self.sender.close()
    }

    /// Returns an iterator that receives values until the channel is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        self.receiver.iter()
    }

    /// Returns an iterator over the values that can be received without blocking.
    pub fn try_iter(&self) -> TryIter<'_, T> {
        self.receiver.try_iter()
    }

    /// Returns the number of buffered values.
    pub fn len(&self) -> usize {
        self.sender.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the buffer has no spare capacity (always for rendezvous channels).
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.sender.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.sender.shared.is_closed()
    }

    /// Returns `true` if `self` and `other` are handles to the same channel.
    pub fn same_channel(&self, other: &Channel<T>) -> bool {
        Arc::ptr_eq(&self.sender.shared, &other.sender.shared)
    }
}

/// The sending half of a [`Channel`].
pub struct Sender<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<T> Sender<T> {
    /// See [`Channel::send`].
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.shared.send(value)
    }

    /// See [`Channel::try_send`].
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.shared.try_send(value)
    }

    /// See [`Channel::send_timeout`].
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        match deadline_after(timeout) {
            Some(deadline) => self.shared.send_deadline(value, deadline),
            None => self
                .shared
                .send(value)
                .map_err(|SendError(value)| SendTimeoutError::Closed(value)),
        }
    }

    /// See [`Channel::close`].
    pub fn close(&self) -> Result<(), CloseError> {
        self.shared.close()
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// The receiving half of a [`Channel`].
pub struct Receiver<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<T> Receiver<T> {
    /// See [`Channel::recv`].
    pub fn recv(&self) -> Option<T> {
        self.shared.recv()
    }

    /// See [`Channel::recv_ok`].
    pub fn recv_ok(&self) -> (T, bool)
    where
        T: Default,
    {
        match self.recv() {
            Some(value) => (value, true),
            None => (T::default(), false),
        }
    }

    /// See [`Channel::try_recv`].
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.shared.try_recv()
    }

    /// See [`Channel::recv_timeout`].
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        match deadline_after(timeout) {
            Some(deadline) => self.shared.recv_deadline(deadline),
            None => self.recv().ok_or(RecvTimeoutError::Closed),
        }
    }

    /// See [`Channel::iter`].
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { receiver: self }
    }

    /// See [`Channel::try_iter`].
    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { receiver: self }
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// Blocking iterator returned by [`Receiver::iter`].
#[derive(Debug)]
pub struct Iter<'a, T> {
    receiver: &'a Receiver<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv()
    }
}

/// Non-blocking iterator returned by [`Receiver::try_iter`].
#[derive(Debug)]
pub struct TryIter<'a, T> {
    receiver: &'a Receiver<T>,
}

impl<'a, T> Iterator for TryIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// Owning blocking iterator over a [`Receiver`].
#[derive(Debug)]
pub struct IntoIter<T> {
    receiver: Receiver<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv()
    }
}

impl<T> IntoIterator for Receiver<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { receiver: self }
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

impl<'a, T> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
