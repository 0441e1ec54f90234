//! Push-to-pull stream bridging.
//!
//! Producers push events into a [`StreamObserver`]. Consumers pull them from
//! a [`MatchStream`], an ordinary `Iterator` of `Result<T>` that:
//! - starts its upstream only on first demand
//! - preserves producer order
//! - yields a producer error exactly once, then ends
//! - propagates `cancel()` (or drop) upstream through a hook
//!
//! # Example
//!
//! ```ignore
//! let (mut sink, stream) = MatchStream::channel(16);
//! std::thread::spawn(move || {
//!     sink.on_next(book);
//!     sink.on_completed();
//! });
//!
//! for book in stream {
//!     println!("{}", book?);
//! }
//! ```

mod observer;
mod sequence;

pub use observer::{GuardedObserver, StreamObserver, StreamState};
pub use sequence::{
    BufferFull, CancelHook, DemandHook, MatchStream, StreamSink, DEFAULT_BUFFER_SIZE,
};

/// Stream of search results.
pub type BookStream = MatchStream<crate::types::Book>;
