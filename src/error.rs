//! Error types returned by channel and latch operations.
//!
//! Errors for operations that carry a value hand that value back, so a failed send never loses
//! the message. Their [`Debug`] output elides the value, which lets them be used with `unwrap`
//! for any message type.

use std::fmt;

use thiserror::Error;

/// A send on a closed channel.
///
/// Returned by [`Channel::send`][crate::Channel::send]. The channel remains valid for receiving.
#[derive(Error, PartialEq, Eq, Clone, Copy)]
#[error("sending on a closed channel")]
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// Returns the message that could not be sent.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError { .. }")
    }
}

/// An error returned by [`Channel::try_send`][crate::Channel::try_send].
#[derive(Error, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    /// The buffer is full and no receiver is waiting.
    #[error("sending on a full channel")]
    Full(T),
    /// The channel has been closed.
    #[error("sending on a closed channel")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Returns the message that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TrySendError::Closed(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// An error returned by [`Channel::send_timeout`][crate::Channel::send_timeout].
#[derive(Error, PartialEq, Eq, Clone, Copy)]
pub enum SendTimeoutError<T> {
    /// No receiver took the message before the timeout elapsed.
    #[error("timed out waiting on a send operation")]
    Timeout(T),
    /// The channel was closed before or while waiting.
    #[error("sending on a closed channel")]
    Closed(T),
}

impl<T> SendTimeoutError<T> {
    /// Returns the message that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            SendTimeoutError::Timeout(v) | SendTimeoutError::Closed(v) => v,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SendTimeoutError::Timeout(_))
    }
}

impl<T> fmt::Debug for SendTimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendTimeoutError::Timeout(_) => f.write_str("Timeout(..)"),
            SendTimeoutError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// An error returned by [`Channel::try_recv`][crate::Channel::try_recv].
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    /// Nothing is buffered and no sender is waiting, but the channel is still open.
    #[error("receiving on an empty channel")]
    Empty,
    /// The channel is closed and drained.
    #[error("receiving on a closed channel")]
    Closed,
}

/// An error returned by [`Channel::recv_timeout`][crate::Channel::recv_timeout].
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum RecvTimeoutError {
    #[error("timed out waiting on a receive operation")]
    Timeout,
    #[error("receiving on a closed channel")]
    Closed,
}

/// Closing a channel that was already closed.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("close of closed channel")]
pub struct CloseError {
    pub(crate) _priv: (),
}

/// A [`Latch`][crate::Latch] counter was driven below zero.
///
/// This is a usage error. The latch is unusable afterwards: every current and future waiter, and
/// every further [`Latch::add`][crate::Latch::add], reports this error.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("latch counter went negative ({counter})")]
pub struct NegativeCounter {
    /// The counter value that the offending `add` would have produced.
    pub counter: i64,
}
