//! Framed TCP transport for `SearchBooks`.
//!
//! One connection carries many independent calls, each identified by a
//! client-assigned [`CallId`]. A call is one `Request` frame from the client
//! answered by zero or more `Message` frames and exactly one `Completed` or
//! `Error` frame, unless the client sends `Cancel` first.
//!
//! # Example
//!
//! ```ignore
//! let server = Server::bind(ServerConfig::default(), BookService::demo())?;
//!
//! let client = BookClient::connect(ClientConfig {
//!     target: server.local_addr().to_string(),
//!     ..Default::default()
//! })?;
//!
//! for book in client.search_books(BookFilter::new().with_id("book-1")) {
//!     println!("{}", book?);
//! }
//! ```

mod client;
mod frame;
mod server;

pub use client::{BookClient, Channel, ChannelConfig, ClientConfig, Connection};
pub use frame::{read_frame, write_frame, CallId, Frame, DEFAULT_MAX_FRAME_BYTES, SEARCH_BOOKS};
pub use server::{Server, ServerConfig, ServerHandle};
