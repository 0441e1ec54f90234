//! Push-side delivery contract.

use crate::error::StreamError;
use tracing::warn;

/// Receiver of a push-style event stream.
///
/// A well-behaved producer calls `on_next` zero or more times and then
/// exactly one of `on_error` / `on_completed`.
pub trait StreamObserver<T>: Send {
    /// A data event.
    fn on_next(&mut self, value: T);

    /// Terminal failure.
    fn on_error(&mut self, error: StreamError);

    /// Terminal success.
    fn on_completed(&mut self);

    /// Whether the consumer has gone away. Producers poll this between steps.
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl<T, O: StreamObserver<T> + ?Sized> StreamObserver<T> for Box<O> {
    fn on_next(&mut self, value: T) {
        (**self).on_next(value)
    }

    fn on_error(&mut self, error: StreamError) {
        (**self).on_error(error)
    }

    fn on_completed(&mut self) {
        (**self).on_completed()
    }

    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

/// Where an observed stream stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Completed,
    Failed,
}

/// Observer wrapper that drops every call after a terminal event.
pub struct GuardedObserver<O> {
    inner: O,
    state: StreamState,
}

impl<O> GuardedObserver<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            state: StreamState::Open,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state != StreamState::Open
    }

    pub fn get_ref(&self) -> &O {
        &self.inner
    }

    pub fn into_inner(self) -> O {
        self.inner
    }
}

impl<T, O: StreamObserver<T>> StreamObserver<T> for GuardedObserver<O> {
    fn on_next(&mut self, value: T) {
        if self.is_terminated() {
            warn!(state = ?self.state, "on_next after terminal event ignored");
            return;
        }
        self.inner.on_next(value);
    }

    fn on_error(&mut self, error: StreamError) {
        if self.is_terminated() {
            warn!(state = ?self.state, %error, "on_error after terminal event ignored");
            return;
        }
        self.state = StreamState::Failed;
        self.inner.on_error(error);
    }

    fn on_completed(&mut self) {
        if self.is_terminated() {
            warn!(state = ?self.state, "on_completed after terminal event ignored");
            return;
        }
        self.state = StreamState::Completed;
        self.inner.on_completed();
    }

    fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}
