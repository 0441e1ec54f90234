//! Pull-based view over a push-based stream.

use crate::error::{Result, StreamError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::observer::StreamObserver;

/// Default number of data events buffered between producer and consumer.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Upstream action run once when the consumer cancels.
pub type CancelHook = Box<dyn FnOnce() + Send>;

/// Consumer-side action run each time a data item is handed to the caller.
pub type DemandHook = Box<dyn FnMut() + Send>;

/// Starts the upstream request on first demand.
type StartFn<T> = Box<dyn FnOnce(StreamSink<T>) -> Option<CancelHook> + Send>;

enum Event<T> {
    Next(T),
    Error(StreamError),
    Completed,
}

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
}

/// Push side of a [`MatchStream`].
///
/// The channel has one slot more than the data buffer so that a terminal
/// event can always be queued after [`StreamSink::offer`] has filled it.
pub struct StreamSink<T> {
    sender: Sender<Event<T>>,
    shared: Arc<Shared>,
    buffer_size: usize,
    terminated: bool,
}

/// Returned by [`StreamSink::offer`] when the data buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull;

impl<T> StreamSink<T> {
    /// Queue a data event without blocking.
    ///
    /// Fails when `buffer_size` events are already waiting; the value is
    /// dropped. Events after a terminal event or a cancel are discarded.
    pub fn offer(&mut self, value: T) -> std::result::Result<(), BufferFull> {
        if self.terminated || self.is_consumer_gone() {
            return Ok(());
        }
        if self.sender.len() >= self.buffer_size {
            return Err(BufferFull);
        }
        if self.sender.try_send(Event::Next(value)).is_err() {
            self.mark_cancelled();
        }
        Ok(())
    }

    /// Whether a terminal event has been pushed.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn is_consumer_gone(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    fn mark_cancelled(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    fn terminate(&mut self, event: Event<T>, kind: &'static str) {
        if self.terminated {
            warn!(kind, "terminal event after stream already terminated ignored");
            return;
        }
        self.terminated = true;
        if self.is_consumer_gone() {
            return;
        }
        if self.sender.send(event).is_err() {
            self.mark_cancelled();
        }
    }
}

impl<T: Send> StreamObserver<T> for StreamSink<T> {
    /// Queue a data event, blocking while the buffer is full.
    fn on_next(&mut self, value: T) {
        if self.terminated {
            warn!("on_next after stream already terminated ignored");
            return;
        }
        if self.is_consumer_gone() {
            return;
        }
        // Fails only once the consumer has dropped its receiver.
        if self.sender.send(Event::Next(value)).is_err() {
            self.mark_cancelled();
        }
    }

    fn on_error(&mut self, error: StreamError) {
        self.terminate(Event::Error(error), "error");
    }

    fn on_completed(&mut self) {
        self.terminate(Event::Completed, "completed");
    }

    fn is_cancelled(&self) -> bool {
        self.is_consumer_gone()
    }
}

enum Phase<T> {
    /// Not yet requested.
    Pending(StartFn<T>),
    /// Request running, events arrive on the receiver.
    Open(Receiver<Event<T>>),
    /// Terminal event consumed, or cancelled.
    Finished,
}

/// Lazily started, cancellable, ordered sequence of stream elements.
///
/// Iterating yields `Ok(item)` for each data event. Completion ends the
/// iteration; an error is yielded once as `Err` and then the iteration ends.
/// Cancellation (explicit or by dropping) ends the iteration cleanly.
pub struct MatchStream<T> {
    phase: Phase<T>,
    shared: Arc<Shared>,
    cancel_hook: Option<CancelHook>,
    demand_hook: Option<DemandHook>,
    buffer_size: usize,
    requested: bool,
    deadline: Option<Instant>,
}

impl<T: Send + 'static> MatchStream<T> {
    /// A stream whose upstream is started by `start` on first demand.
    ///
    /// `start` receives the push side and may return a hook that is run if
    /// the consumer cancels before the stream terminates.
    pub fn lazy<F>(buffer_size: usize, start: F) -> Self
    where
        F: FnOnce(StreamSink<T>) -> Option<CancelHook> + Send + 'static,
    {
        Self {
            phase: Phase::Pending(Box::new(start)),
            shared: Arc::new(Shared::default()),
            cancel_hook: None,
            demand_hook: None,
            buffer_size: buffer_size.max(1),
            requested: false,
            deadline: None,
        }
    }

    /// An already-open stream and the sink that feeds it.
    pub fn channel(buffer_size: usize) -> (StreamSink<T>, Self) {
        let buffer_size = buffer_size.max(1);
        let shared = Arc::new(Shared::default());
        let (sink, receiver) = Self::bridge(buffer_size, &shared);

        let stream = Self {
            phase: Phase::Open(receiver),
            shared,
            cancel_hook: None,
            demand_hook: None,
            buffer_size,
            requested: false,
            deadline: None,
        };
        (sink, stream)
    }

    /// A stream that fails with `error` on first demand.
    pub fn failed(error: StreamError) -> Self {
        Self::lazy(1, move |mut sink| {
            sink.on_error(error);
            None
        })
    }

    /// Register a hook run if the consumer cancels before termination.
    pub fn on_cancel(mut self, hook: CancelHook) -> Self {
        self.cancel_hook = Some(hook);
        self
    }

    /// Register a hook run after each item the consumer takes.
    pub fn on_demand(mut self, hook: DemandHook) -> Self {
        self.demand_hook = Some(hook);
        self
    }

    /// Fail with `DeadlineExceeded` and cancel upstream if the stream has not
    /// terminated within `timeout` from now. A stream first pulled after the
    /// deadline never starts its upstream.
    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    fn bridge(buffer_size: usize, shared: &Arc<Shared>) -> (StreamSink<T>, Receiver<Event<T>>) {
        let (sender, receiver) = bounded(buffer_size + 1);
        let sink = StreamSink {
            sender,
            shared: Arc::clone(shared),
            buffer_size,
            terminated: false,
        };
        (sink, receiver)
    }

    /// Signal demand, starting the upstream request if needed.
    pub fn request(&mut self) {
        self.requested = true;
        if !matches!(self.phase, Phase::Pending(_)) || self.deadline_passed() {
            return;
        }

        let (sink, receiver) = Self::bridge(self.buffer_size, &self.shared);
        if let Phase::Pending(start) = std::mem::replace(&mut self.phase, Phase::Open(receiver)) {
            if let Some(hook) = start(sink) {
                self.cancel_hook = Some(hook);
            }
        }
    }

    /// Whether the caller has asked for at least one item.
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// Whether the next pull would return without blocking.
    pub fn is_ready(&self) -> bool {
        match &self.phase {
            Phase::Pending(_) => false,
            Phase::Open(receiver) => !receiver.is_empty(),
            Phase::Finished => true,
        }
    }

    /// Whether the stream has ended (terminated or cancelled).
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished)
    }

    /// Non-blocking pull.
    ///
    /// `None` means either "nothing available yet" or "finished"; check
    /// [`MatchStream::is_finished`] to tell them apart.
    pub fn try_next(&mut self) -> Option<Result<T>> {
        self.request();
        if self.deadline_expired() {
            return Some(self.expire());
        }

        let received = match &self.phase {
            Phase::Open(receiver) => receiver.try_recv(),
            _ => return None,
        };
        match received {
            Ok(event) => self.deliver(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.abandoned()),
        }
    }

    /// Stop consuming.
    ///
    /// No further items are delivered. If the stream had not terminated yet,
    /// the upstream cancel hook runs once.
    pub fn cancel(&mut self) {
        let was_live = matches!(self.phase, Phase::Open(_));
        self.shared.cancelled.store(true, Ordering::Release);
        // Dropping the receiver unblocks a producer waiting on a full buffer.
        self.phase = Phase::Finished;
        self.demand_hook = None;

        if let Some(hook) = self.cancel_hook.take() {
            if was_live {
                debug!("stream cancelled by consumer");
                hook();
            }
        }
    }

    /// Drain the stream, returning every item or the terminal error.
    pub fn collect_all(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for item in &mut self {
            items.push(item?);
        }
        Ok(items)
    }

    fn deliver(&mut self, event: Event<T>) -> Option<Result<T>> {
        match event {
            Event::Next(value) => {
                if let Some(hook) = self.demand_hook.as_mut() {
                    hook();
                }
                Some(Ok(value))
            }
            Event::Completed => {
                self.finish();
                None
            }
            Event::Error(error) => {
                self.finish();
                Some(Err(error))
            }
        }
    }

    fn finish(&mut self) {
        self.phase = Phase::Finished;
        self.cancel_hook = None;
        self.demand_hook = None;
    }

    fn abandoned(&mut self) -> Result<T> {
        self.finish();
        Err(StreamError::Internal(
            "stream closed without a terminal event".into(),
        ))
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Deadline passed while the stream is still live or was never started.
    fn deadline_expired(&self) -> bool {
        !self.is_finished() && self.deadline_passed()
    }

    fn expire(&mut self) -> Result<T> {
        debug!("stream deadline exceeded");
        self.cancel();
        Err(StreamError::DeadlineExceeded)
    }
}

impl<T: Send + 'static> Iterator for MatchStream<T> {
    type Item = Result<T>;

    /// Blocking pull.
    fn next(&mut self) -> Option<Self::Item> {
        self.request();
        if self.deadline_expired() {
            return Some(self.expire());
        }

        let received = match (&self.phase, self.deadline) {
            (Phase::Open(receiver), Some(deadline)) => receiver.recv_deadline(deadline),
            (Phase::Open(receiver), None) => receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
            _ => return None,
        };

        match received {
            Ok(event) => self.deliver(event),
            Err(RecvTimeoutError::Timeout) => Some(self.expire()),
            Err(RecvTimeoutError::Disconnected) => Some(self.abandoned()),
        }
    }
}

impl<T> Drop for MatchStream<T> {
    fn drop(&mut self) {
        if !matches!(self.phase, Phase::Open(_)) {
            return;
        }
        self.shared.cancelled.store(true, Ordering::Release);
        self.phase = Phase::Finished;
        if let Some(hook) = self.cancel_hook.take() {
            hook();
        }
    }
}
