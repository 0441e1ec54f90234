//! # Book Stream
//!
//! A streaming search service over an in-memory book catalog.
//!
//! ## Core Concepts
//!
//! - **Store**: Ordered, read-mostly catalog of books and authors
//! - **Matcher**: A book matches when any specified filter field is equal
//! - **Producer**: Streams matches in store order, then exactly one terminal event
//! - **Stream**: Pull-based, lazily started, cancellable view of a pushed stream
//! - **Transport**: Framed TCP connections multiplexing many calls
//!
//! ## Example
//!
//! ```ignore
//! use bookstream::{BookClient, BookFilter, BookService, ClientConfig, Server, ServerConfig};
//!
//! let server = Server::bind(
//!     ServerConfig { bind_addr: "127.0.0.1:0".into(), ..Default::default() },
//!     BookService::demo(),
//! )?;
//!
//! let client = BookClient::connect(ClientConfig {
//!     target: server.local_addr().to_string(),
//!     ..Default::default()
//! })?;
//!
//! let books = client
//!     .search_books(BookFilter::new().with_page_count(436))
//!     .collect_all()?;
//! assert_eq!(books[0].name, "Down Under");
//! ```

pub mod error;
pub mod matcher;
pub mod producer;
pub mod store;
pub mod stream;
pub mod transport;
pub mod types;

// Re-exports
pub use error::{Result, Status, StatusCode, StreamError};
pub use matcher::{is_match, matching};
pub use producer::{BookService, SearchOutcome};
pub use store::{BookStore, RecordScan, RecordSource};
pub use stream::{
    BookStream, BufferFull, CancelHook, DemandHook, GuardedObserver, MatchStream, StreamObserver,
    StreamSink, StreamState, DEFAULT_BUFFER_SIZE,
};
pub use transport::{
    read_frame, write_frame, BookClient, CallId, Channel, ChannelConfig, ClientConfig,
    Connection, Frame, Server, ServerConfig, ServerHandle, DEFAULT_MAX_FRAME_BYTES, SEARCH_BOOKS,
};
pub use types::*;
