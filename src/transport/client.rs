//! Client side of the transport: connections, a connection cache, and the
//! `BookClient` facade.

use crate::error::{Result, StreamError};
use crate::stream::{
    BookStream, CancelHook, DemandHook, MatchStream, StreamObserver, StreamSink,
    DEFAULT_BUFFER_SIZE,
};
use crate::types::{Book, BookFilter};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::BufReader;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::frame::{read_frame, write_frame, CallId, Frame, DEFAULT_MAX_FRAME_BYTES, SEARCH_BOOKS};

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server address (`host:port`).
    pub target: String,

    /// Results buffered per call. The server pauses a call once this many
    /// results are waiting to be consumed.
    /// Default: 256
    pub buffer_size: usize,

    /// Timeout for establishing the TCP connection.
    /// Default: 5s
    pub connect_timeout: Duration,

    /// Deadline applied to every call (None = no deadline).
    pub request_deadline: Option<Duration>,

    /// Largest accepted frame body.
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: "localhost:9090".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(5),
            request_deadline: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

struct ConnectionInner {
    target: String,
    config: ClientConfig,
    writer: Mutex<TcpStream>,
    /// Push side of every call waiting for frames.
    calls: Mutex<HashMap<CallId, StreamSink<Book>>>,
    next_call: AtomicU64,
    /// Only changed while `calls` is locked.
    closed: AtomicBool,
}

impl ConnectionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        let mut stream = self.writer.lock();
        write_frame(&mut *stream, frame, self.config.max_frame_bytes)
    }

    fn window(&self) -> u64 {
        self.config.buffer_size.max(1) as u64
    }

    /// Register the call and send its request frame.
    fn start_call(&self, call_id: CallId, filter: BookFilter, mut sink: StreamSink<Book>) -> bool {
        {
            let mut calls = self.calls.lock();
            if self.is_closed() {
                drop(calls);
                sink.on_error(StreamError::connection_closed());
                return false;
            }
            calls.insert(call_id, sink);
        }

        let request = Frame::Request {
            call_id,
            method: SEARCH_BOOKS.to_string(),
            filter,
            window: self.window(),
        };
        if let Err(e) = self.send(&request) {
            warn!(server = %self.target, %call_id, error = %e, "request could not be sent");
            if let Some(mut sink) = self.calls.lock().remove(&call_id) {
                sink.on_error(StreamError::Unavailable(e.to_string()));
            }
            return false;
        }

        debug!(server = %self.target, %call_id, "call started");
        true
    }

    /// Let the server send `n` more results for a call that is still live.
    fn grant(&self, call_id: CallId, n: u64) {
        if self.is_closed() || !self.calls.lock().contains_key(&call_id) {
            return;
        }
        if let Err(e) = self.send(&Frame::Credit { call_id, n }) {
            debug!(server = %self.target, %call_id, error = %e, "credit could not be sent");
        }
    }

    fn cancel_call(&self, call_id: CallId) {
        if self.calls.lock().remove(&call_id).is_none() {
            return;
        }
        if self.is_closed() {
            return;
        }
        debug!(server = %self.target, %call_id, "cancelling call");
        if let Err(e) = self.send(&Frame::Cancel { call_id }) {
            debug!(server = %self.target, %call_id, error = %e, "cancel could not be sent");
        }
    }

    /// Mark closed and fail every in-flight call with `error`.
    fn fail_all(&self, error: impl Fn() -> StreamError) {
        let drained: Vec<_> = {
            let mut calls = self.calls.lock();
            self.closed.store(true, Ordering::SeqCst);
            calls.drain().collect()
        };
        for (call_id, mut sink) in drained {
            debug!(server = %self.target, %call_id, "failing in-flight call");
            sink.on_error(error());
        }
    }

    /// Route one server frame to its call.
    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Message { call_id, book } => {
                let mut calls = self.calls.lock();
                let Some(sink) = calls.get_mut(&call_id) else {
                    return;
                };
                if sink.is_cancelled() {
                    // Consumer went away before its cancel hook ran.
                    calls.remove(&call_id);
                    drop(calls);
                    let _ = self.send(&Frame::Cancel { call_id });
                    return;
                }
                if sink.offer(book).is_err() {
                    let mut sink = calls.remove(&call_id);
                    drop(calls);
                    warn!(server = %self.target, %call_id, "server exceeded the call window, failing call");
                    if let Some(sink) = sink.as_mut() {
                        sink.on_error(StreamError::Internal(format!(
                            "server sent more than {} unconsumed results",
                            self.window()
                        )));
                    }
                    let _ = self.send(&Frame::Cancel { call_id });
                }
            }
            Frame::Completed { call_id } => {
                if let Some(mut sink) = self.calls.lock().remove(&call_id) {
                    sink.on_completed();
                }
            }
            Frame::Error { call_id, status } => {
                if let Some(mut sink) = self.calls.lock().remove(&call_id) {
                    sink.on_error(status.into());
                }
            }
            other => {
                warn!(server = %self.target, call_id = %other.call_id(), "unexpected frame from server ignored");
            }
        }
    }
}

/// One TCP connection multiplexing many independent calls.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to `config.target`.
    pub fn open(config: ClientConfig) -> Result<Self> {
        let stream = connect(&config.target, config.connect_timeout)?;
        stream.set_nodelay(true)?;
        let read_half = stream.try_clone()?;

        let inner = Arc::new(ConnectionInner {
            target: config.target.clone(),
            config,
            writer: Mutex::new(stream),
            calls: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let reader_inner = Arc::clone(&inner);
        let reader = thread::Builder::new()
            .name("bookstream-client-reader".to_string())
            .spawn(move || read_loop(read_half, reader_inner))?;

        info!(server = %inner.target, "connected");

        Ok(Self {
            inner,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of calls still waiting for frames.
    pub fn in_flight(&self) -> usize {
        self.inner.calls.lock().len()
    }

    /// Start a `SearchBooks` call.
    ///
    /// Nothing is sent until the returned stream is first pulled. Transport
    /// failures are delivered through the stream, never returned here.
    ///
    /// The server may run at most `buffer_size` results ahead of the
    /// consumer; credit is returned in batches as results are taken.
    pub fn search_books(&self, filter: BookFilter) -> BookStream {
        let call_id = CallId(self.inner.next_call.fetch_add(1, Ordering::SeqCst));

        let start_inner = Arc::clone(&self.inner);
        let stream = MatchStream::lazy(self.inner.window() as usize, move |sink| {
            if !start_inner.start_call(call_id, filter, sink) {
                return None;
            }
            let hook: CancelHook = Box::new(move || start_inner.cancel_call(call_id));
            Some(hook)
        });

        let credit_inner = Arc::clone(&self.inner);
        let batch = (self.inner.window() / 2).max(1);
        let mut consumed = 0;
        let demand: DemandHook = Box::new(move || {
            consumed += 1;
            if consumed >= batch {
                credit_inner.grant(call_id, consumed);
                consumed = 0;
            }
        });
        let stream = stream.on_demand(demand);

        match self.inner.config.request_deadline {
            Some(deadline) => stream.with_deadline(deadline),
            None => stream,
        }
    }

    /// Close the connection, failing in-flight calls with `Unavailable`.
    pub fn close(&self) {
        if !self.inner.is_closed() {
            info!(server = %self.inner.target, "closing connection");
        }
        self.inner.fail_all(StreamError::connection_closed);
        let _ = self.inner.writer.lock().shutdown(Shutdown::Both);

        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect(target: &str, timeout: Duration) -> Result<TcpStream> {
    let addrs = target
        .to_socket_addrs()
        .map_err(|e| StreamError::Unavailable(format!("cannot resolve {}: {}", target, e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(StreamError::Unavailable(match last_error {
        Some(e) => format!("cannot connect to {}: {}", target, e),
        None => format!("no addresses for {}", target),
    }))
}

fn read_loop(stream: TcpStream, inner: Arc<ConnectionInner>) {
    let mut reader = BufReader::new(stream);
    let reason = loop {
        match read_frame(&mut reader, inner.config.max_frame_bytes) {
            Ok(Some(frame)) => inner.dispatch(frame),
            Ok(None) => break "connection closed by server".to_string(),
            Err(e) => break format!("connection lost: {}", e),
        }
    };

    if !inner.is_closed() {
        warn!(server = %inner.target, %reason, "connection terminated");
    }
    inner.fail_all(|| StreamError::Unavailable(reason.clone()));
}

/// Connection cache configuration.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Max cached connections; least recently used ones are dropped.
    /// Default: 16
    pub max_connections: usize,

    /// Settings for new connections. `target` is replaced per open.
    pub client: ClientConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            client: ClientConfig::default(),
        }
    }
}

/// Hands out one shared connection per target.
pub struct Channel {
    config: ChannelConfig,
    connections: Mutex<LruCache<String, Arc<Connection>>>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_connections).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            connections: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Connection to `target`, reusing a live cached one.
    pub fn open(&self, target: &str) -> Result<Arc<Connection>> {
        if let Some(existing) = self.live(target) {
            return Ok(existing);
        }

        let config = ClientConfig {
            target: target.to_string(),
            ..self.config.client.clone()
        };
        let connection = Arc::new(Connection::open(config)?);

        let evicted = {
            let mut connections = self.connections.lock();
            // Another caller may have connected while this one did.
            if let Some(existing) = connections.get(target) {
                if !existing.is_closed() {
                    let existing = Arc::clone(existing);
                    drop(connections);
                    debug!(server = %target, "concurrent open, using cached connection");
                    return Ok(existing);
                }
            }
            connections.push(target.to_string(), Arc::clone(&connection))
        };

        // Dropping an evicted connection may close it, never under the lock.
        if let Some((evicted, _)) = evicted {
            if evicted != target {
                debug!(server = %evicted, "evicted cached connection");
            }
        }
        Ok(connection)
    }

    fn live(&self, target: &str) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock();
        match connections.get(target) {
            Some(existing) if !existing.is_closed() => Some(Arc::clone(existing)),
            Some(_) => {
                debug!(server = %target, "cached connection closed, reconnecting");
                None
            }
            None => None,
        }
    }

    /// Number of cached connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every cached connection.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut connections = self.connections.lock();
            let mut drained = Vec::with_capacity(connections.len());
            while let Some((_, connection)) = connections.pop_lru() {
                drained.push(connection);
            }
            drained
        };
        for connection in drained {
            connection.close();
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

/// Client for the book search service.
pub struct BookClient {
    connection: Connection,
}

impl BookClient {
    /// Connect to `config.target`.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            connection: Connection::open(config)?,
        })
    }

    /// Stream books matching `filter`.
    pub fn search_books(&self, filter: BookFilter) -> BookStream {
        self.connection.search_books(filter)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn close(&self) {
        self.connection.close();
    }
}
