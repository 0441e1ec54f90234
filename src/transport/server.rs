//! TCP server hosting the search service.

use crate::error::{Result, StreamError};
use crate::producer::{BookService, SearchOutcome};
use crate::stream::{GuardedObserver, StreamObserver};
use crate::types::{Book, BookFilter};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::frame::{read_frame, write_frame, CallId, Frame, DEFAULT_MAX_FRAME_BYTES, SEARCH_BOOKS};

/// How often a call waiting for credit re-checks its cancel flag.
const CREDIT_POLL: Duration = Duration::from_millis(50);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on (`host:port`, port 0 picks a free port).
    pub bind_addr: String,

    /// Largest accepted frame body.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

struct ServerShared {
    service: BookService,
    max_frame_bytes: usize,
    shutdown: AtomicBool,
    active_calls: AtomicUsize,
    cancel_requests: AtomicU64,
    next_connection: AtomicU64,
    /// Socket clones used to interrupt connection readers on shutdown.
    connections: Mutex<HashMap<u64, TcpStream>>,
}

/// Entry point for hosting [`BookService`] over TCP.
pub struct Server;

impl Server {
    /// Bind the listener and start accepting connections.
    pub fn bind(config: ServerConfig, service: BookService) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&config.bind_addr).map_err(|e| {
            StreamError::Unavailable(format!("cannot bind {}: {}", config.bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            service,
            max_frame_bytes: config.max_frame_bytes,
            shutdown: AtomicBool::new(false),
            active_calls: AtomicUsize::new(0),
            cancel_requests: AtomicU64::new(0),
            next_connection: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = thread::Builder::new()
            .name("bookstream-accept".to_string())
            .spawn(move || accept_loop(listener, accept_shared))?;

        info!(%local_addr, "server listening");

        Ok(ServerHandle {
            local_addr,
            shared,
            accept_thread: Some(accept_thread),
        })
    }
}

/// Handle to a running server. Dropping it shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of calls whose producer is still running.
    pub fn active_calls(&self) -> usize {
        self.shared.active_calls.load(Ordering::SeqCst)
    }

    /// Number of client `Cancel` frames that stopped a running call.
    pub fn cancel_requests(&self) -> u64 {
        self.shared.cancel_requests.load(Ordering::SeqCst)
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Stop accepting, cancel running calls and close every connection.
    pub fn shutdown(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // Wake the blocking accept.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }

        for (_, stream) in self.shared.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        info!(local_addr = %self.local_addr, "server stopped");
    }

    /// Block until the accept loop exits.
    pub fn wait(mut self) {
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    for incoming in listener.incoming() {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let id = shared.next_connection.fetch_add(1, Ordering::SeqCst);
        match stream.try_clone() {
            Ok(clone) => {
                shared.connections.lock().insert(id, clone);
            }
            Err(e) => {
                warn!(connection = id, error = %e, "could not register connection");
                continue;
            }
        }
        // Shutdown may have drained the registry before the insert above.
        if shared.shutdown.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            shared.connections.lock().remove(&id);
            break;
        }

        let conn_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("bookstream-conn-{}", id))
            .spawn(move || {
                if let Err(e) = serve_connection(id, stream, &conn_shared) {
                    warn!(connection = id, error = %e, "connection failed");
                }
                conn_shared.connections.lock().remove(&id);
            });
        if let Err(e) = spawned {
            warn!(connection = id, error = %e, "could not spawn connection thread");
            shared.connections.lock().remove(&id);
        }
    }
}

/// Per-call state shared between the connection reader and the call worker.
struct CallControl {
    cancelled: AtomicBool,
    grants: Sender<u64>,
}

impl CallControl {
    /// Set the cancel flag, returning whether it was newly set.
    fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Calls running on one connection.
type CallTable = Arc<Mutex<HashMap<CallId, Arc<CallControl>>>>;

fn serve_connection(id: u64, stream: TcpStream, shared: &Arc<ServerShared>) -> Result<()> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    debug!(connection = id, %peer, "connection accepted");

    let writer = Arc::new(Mutex::new(stream.try_clone()?));
    let mut reader = BufReader::new(stream);
    let calls: CallTable = Arc::new(Mutex::new(HashMap::new()));

    let result = loop {
        let frame = match read_frame(&mut reader, shared.max_frame_bytes) {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        match frame {
            Frame::Request {
                call_id,
                method,
                filter,
                window,
            } => {
                if method != SEARCH_BOOKS {
                    let error = StreamError::Unimplemented(format!("unknown method {}", method));
                    let _ = send(&writer, shared, &Frame::Error {
                        call_id,
                        status: error.status(),
                    });
                    continue;
                }
                start_call(shared, &calls, &writer, call_id, filter, window);
            }
            Frame::Credit { call_id, n } => {
                if let Some(control) = calls.lock().get(&call_id) {
                    let _ = control.grants.send(n);
                }
            }
            Frame::Cancel { call_id } => {
                if let Some(control) = calls.lock().get(&call_id) {
                    if control.cancel() {
                        debug!(connection = id, %call_id, "call cancelled by client");
                        shared.cancel_requests.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            other => {
                warn!(connection = id, call_id = %other.call_id(), "unexpected frame from client ignored");
            }
        }
    };

    // The client is gone, stop everything it started.
    for control in calls.lock().values() {
        control.cancel();
    }
    debug!(connection = id, %peer, "connection closed");
    result
}

fn start_call(
    shared: &Arc<ServerShared>,
    calls: &CallTable,
    writer: &Arc<Mutex<TcpStream>>,
    call_id: CallId,
    filter: BookFilter,
    window: u64,
) {
    let (grants, grant_rx) = unbounded();
    let control = Arc::new(CallControl {
        cancelled: AtomicBool::new(false),
        grants,
    });
    {
        let mut table = calls.lock();
        if table.contains_key(&call_id) {
            drop(table);
            let error = StreamError::InvalidArgument(format!("call {} already running", call_id));
            let _ = send(writer, shared, &Frame::Error {
                call_id,
                status: error.status(),
            });
            return;
        }
        table.insert(call_id, Arc::clone(&control));
    }
    shared.active_calls.fetch_add(1, Ordering::SeqCst);

    let observer = CallObserver {
        call_id,
        writer: Arc::clone(writer),
        shared: Arc::clone(shared),
        control,
        credit: window,
        grants: grant_rx,
        failed: false,
    };
    let worker_shared = Arc::clone(shared);
    let worker_calls = Arc::clone(calls);

    let spawned = thread::Builder::new()
        .name(format!("bookstream-call-{}", call_id))
        .spawn(move || {
            let mut observer = GuardedObserver::new(observer);
            let outcome = worker_shared.service.search_books(&filter, &mut observer);
            match outcome {
                SearchOutcome::Completed { matched, scanned } => {
                    debug!(%call_id, matched, scanned, "call completed")
                }
                SearchOutcome::Failed { matched, scanned } => {
                    debug!(%call_id, matched, scanned, "call failed")
                }
                SearchOutcome::Cancelled { matched, scanned } => {
                    debug!(%call_id, matched, scanned, "call cancelled")
                }
            }
            worker_calls.lock().remove(&call_id);
            worker_shared.active_calls.fetch_sub(1, Ordering::SeqCst);
        });

    if let Err(e) = spawned {
        warn!(%call_id, error = %e, "could not spawn call worker");
        calls.lock().remove(&call_id);
        shared.active_calls.fetch_sub(1, Ordering::SeqCst);
        let error = StreamError::Internal("server overloaded".into());
        let _ = send(writer, shared, &Frame::Error {
            call_id,
            status: error.status(),
        });
    }
}

/// Write one frame to the connection.
fn send(writer: &Mutex<TcpStream>, shared: &ServerShared, frame: &Frame) -> Result<()> {
    let mut stream = writer.lock();
    write_frame(&mut *stream, frame, shared.max_frame_bytes).map_err(|e| {
        debug!(call_id = %frame.call_id(), error = %e, "frame write failed");
        e
    })
}

/// Pushes one call's events onto the connection.
///
/// A `Message` is only written while the client has granted credit for it;
/// the worker waits for more otherwise.
struct CallObserver {
    call_id: CallId,
    writer: Arc<Mutex<TcpStream>>,
    shared: Arc<ServerShared>,
    control: Arc<CallControl>,
    /// Messages the client still accepts.
    credit: u64,
    grants: Receiver<u64>,
    /// A frame could not be encoded and an error was sent in its place.
    failed: bool,
}

impl CallObserver {
    /// Take one unit of credit, waiting for a grant if none is left.
    /// Returns false if the call ended while waiting.
    fn acquire_credit(&mut self) -> bool {
        while self.credit == 0 {
            if self.is_cancelled() {
                return false;
            }
            match self.grants.recv_timeout(CREDIT_POLL) {
                Ok(n) => self.credit = self.credit.saturating_add(n),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        self.credit -= 1;
        true
    }

    fn emit(&mut self, frame: Frame) {
        match send(&self.writer, &self.shared, &frame) {
            Ok(()) => {}
            Err(StreamError::Io(_)) => {
                // Connection broken, let the producer stop at its next step.
                self.control.cancel();
            }
            Err(e) => {
                // Nothing was written, the connection is still usable.
                warn!(call_id = %self.call_id, error = %e, "frame could not be encoded, failing call");
                self.failed = true;
                let status = StreamError::Internal("result could not be encoded".into()).status();
                let error = Frame::Error {
                    call_id: self.call_id,
                    status,
                };
                if send(&self.writer, &self.shared, &error).is_err() {
                    self.control.cancel();
                }
            }
        }
    }
}

impl StreamObserver<Book> for CallObserver {
    fn on_next(&mut self, book: Book) {
        if self.is_cancelled() || !self.acquire_credit() {
            return;
        }
        self.emit(Frame::Message {
            call_id: self.call_id,
            book,
        });
    }

    fn on_error(&mut self, error: StreamError) {
        if self.is_cancelled() {
            return;
        }
        self.emit(Frame::Error {
            call_id: self.call_id,
            status: error.status(),
        });
    }

    fn on_completed(&mut self) {
        if self.is_cancelled() {
            return;
        }
        self.emit(Frame::Completed {
            call_id: self.call_id,
        });
    }

    fn is_cancelled(&self) -> bool {
        self.failed
            || self.control.is_cancelled()
            || self.shared.shutdown.load(Ordering::SeqCst)
    }
}
