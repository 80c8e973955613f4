// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Convenience alias used throughout the crate; a [`Future<T>`][crate::Future]
/// resolves to a `Result<T>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The discriminant of an [`Error`].
///
/// Synchronization errors are raised by the runtime itself; everything user
/// code produces travels as [`ErrorKind::User`] and passes through the
/// combinators unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A promise was dropped before it was resolved.
    BrokenPromise,
    /// An `enter` was attempted on a gate that has been closed.
    GateClosed,
    /// An abortable sleep was cancelled before its timer fired.
    SleepAborted,
    /// A semaphore wait did not acquire its units before the deadline.
    SemaphoreTimedOut,
    /// The semaphore was broken while the wait was queued.
    SemaphoreBroken,
    /// An error produced by user code.
    User,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BrokenPromise => "broken promise",
            ErrorKind::GateClosed => "gate closed",
            ErrorKind::SleepAborted => "sleep aborted",
            ErrorKind::SemaphoreTimedOut => "semaphore timed out",
            ErrorKind::SemaphoreBroken => "semaphore broken",
            ErrorKind::User => "error",
        }
    }
}

/// The failure value carried by a [`Future`][crate::Future]'s error channel.
///
/// An `Error` is an opaque, cheaply cloneable carrier: a kind discriminant, a
/// message and an optional `caused by` chain. Cloning shares the underlying
/// allocation, so the same failure can be handed to any number of waiters
/// (e.g. when a semaphore is broken).
#[derive(Clone)]
pub struct Error {
    inner: Arc<Inner>,
}

struct Inner {
    kind: ErrorKind,
    message: Cow<'static, str>,
    cause: Option<Error>,
}

// === impl Error ===

impl Error {
    fn from_kind(kind: ErrorKind, message: Cow<'static, str>) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                message,
                cause: None,
            }),
        }
    }

    /// A user error carrying just a message.
    pub fn msg(message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_kind(ErrorKind::User, message.into())
    }

    /// A user error built from any displayable value, typically a foreign
    /// error type.
    pub fn other(error: impl fmt::Display) -> Self {
        Self::from_kind(ErrorKind::User, Cow::Owned(error.to_string()))
    }

    pub(crate) fn broken_promise() -> Self {
        Self::from_kind(ErrorKind::BrokenPromise, Cow::Borrowed("broken promise"))
    }

    pub(crate) fn gate_closed() -> Self {
        Self::from_kind(ErrorKind::GateClosed, Cow::Borrowed("gate closed"))
    }

    pub(crate) fn sleep_aborted() -> Self {
        Self::from_kind(ErrorKind::SleepAborted, Cow::Borrowed("sleep aborted"))
    }

    pub(crate) fn semaphore_timed_out() -> Self {
        Self::from_kind(
            ErrorKind::SemaphoreTimedOut,
            Cow::Borrowed("semaphore timed out"),
        )
    }

    pub(crate) fn semaphore_broken() -> Self {
        Self::from_kind(ErrorKind::SemaphoreBroken, Cow::Borrowed("semaphore broken"))
    }

    /// Wraps `self` in a new error with the given message, preserving the
    /// kind of the original failure so that predicates such as
    /// [`is_gate_closed`][Self::is_gate_closed] keep working across wrapping.
    #[must_use]
    pub fn context(self, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind: self.inner.kind,
                message: message.into(),
                cause: Some(self),
            }),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    /// The error this one was wrapped around, if any.
    pub fn cause(&self) -> Option<&Error> {
        self.inner.cause.as_ref()
    }

    pub fn is_broken_promise(&self) -> bool {
        self.inner.kind == ErrorKind::BrokenPromise
    }

    pub fn is_gate_closed(&self) -> bool {
        self.inner.kind == ErrorKind::GateClosed
    }

    pub fn is_sleep_aborted(&self) -> bool {
        self.inner.kind == ErrorKind::SleepAborted
    }

    pub fn is_semaphore_timed_out(&self) -> bool {
        self.inner.kind == ErrorKind::SemaphoreTimedOut
    }

    pub fn is_semaphore_broken(&self) -> bool {
        self.inner.kind == ErrorKind::SemaphoreBroken
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.message)?;
        let mut cause = self.cause();
        while let Some(err) = cause {
            write!(f, ": {}", err.inner.message)?;
            cause = err.cause();
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.inner.kind.as_str())
            .field("message", &self.inner.message)
            .field("cause", &self.inner.cause)
            .finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Logging hook invoked when a failed future is dropped without anyone having
/// observed the failure.
pub(crate) fn report_unhandled_exception(err: &Error) {
    tracing::warn!(error = %err, "dropped a failed future that nobody consumed");
}

/// Logging hook invoked when a promise is dropped before it was resolved.
pub(crate) fn report_broken_promise() {
    tracing::warn!("promise dropped without being resolved");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_kind() {
        let err = Error::gate_closed().context("background flush failed");
        assert!(err.is_gate_closed());
        assert_eq!(err.to_string(), "background flush failed: gate closed");
        assert!(err.cause().is_some_and(Error::is_gate_closed));
    }

    #[test]
    fn clones_share_the_chain() {
        let err = Error::msg("root").context("wrapped");
        let clone = err.clone();
        assert_eq!(clone.to_string(), err.to_string());
        assert_eq!(clone.kind(), ErrorKind::User);
    }
}
