//! Error handling and edge case tests.

use bookstream::{
    read_frame, write_frame, Author, Book, BookClient, BookFilter, BookService, BookStore,
    CallId, ClientConfig, Frame, RecordScan, RecordSource, Result, Server, ServerConfig,
    ServerHandle, StatusCode, StreamError, DEFAULT_MAX_FRAME_BYTES, SEARCH_BOOKS,
};
use crossbeam_channel::{unbounded, Receiver};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn start_server(service: BookService) -> ServerHandle {
    Server::bind(
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        },
        service,
    )
    .unwrap()
}

fn client_config(server: &ServerHandle) -> ClientConfig {
    ClientConfig {
        target: server.local_addr().to_string(),
        ..Default::default()
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Demo catalog whose scan fails at position `fail_at`.
struct FaultySource {
    fail_at: usize,
}

impl RecordSource for FaultySource {
    fn scan(&self) -> Result<RecordScan> {
        let fail_at = self.fail_at;
        let books = BookStore::demo().all_records();
        Ok(Box::new((0..books.len()).map(move |i| {
            if i == fail_at {
                Err(StreamError::Corruption(format!("record {} unreadable", i)))
            } else {
                Ok(books[i].clone())
            }
        })))
    }
}

/// Never yields a record until the gate sender is dropped.
struct StalledSource {
    gate: Receiver<()>,
}

impl RecordSource for StalledSource {
    fn scan(&self) -> Result<RecordScan> {
        let gate = self.gate.clone();
        let author = Author::new("author-1", "Joshua", "Bloch");
        Ok(Box::new((0..3).map(move |i| {
            let _ = gate.recv();
            Ok(Book::new(format!("book-{}", i), "Stalled", 100, author.clone()))
        })))
    }
}

fn raw_connect(server: &ServerHandle) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn send_request(
    stream: &mut TcpStream,
    call_id: u64,
    method: &str,
    filter: BookFilter,
    window: u64,
) {
    let frame = Frame::Request {
        call_id: CallId(call_id),
        method: method.to_string(),
        filter,
        window,
    };
    write_frame(stream, &frame, DEFAULT_MAX_FRAME_BYTES).unwrap();
}

// --- Producer Faults ---

#[test]
fn test_fault_mid_stream_delivers_items_then_internal() {
    let server = start_server(BookService::new(Arc::new(FaultySource { fail_at: 2 })));
    let client = BookClient::connect(client_config(&server)).unwrap();

    let filter = BookFilter::new().with_id("book-1").with_page_count(208);
    let mut stream = client.search_books(filter);

    assert_eq!(stream.next().unwrap().unwrap().id, "book-1");
    assert_eq!(stream.next().unwrap().unwrap().id, "book-2");
    match stream.next() {
        Some(Err(StreamError::Internal(message))) => assert!(message.contains("unreadable")),
        other => panic!("expected internal error, got {:?}", other),
    }
    assert!(stream.next().is_none());
}

#[test]
fn test_fault_before_any_match() {
    let server = start_server(BookService::new(Arc::new(FaultySource { fail_at: 0 })));
    let client = BookClient::connect(client_config(&server)).unwrap();

    let result = client
        .search_books(BookFilter::new().with_id("book-3"))
        .collect_all();
    assert!(matches!(result, Err(StreamError::Internal(_))));
}

#[test]
fn test_connection_survives_failed_call() {
    let server = start_server(BookService::new(Arc::new(FaultySource { fail_at: 1 })));
    let client = BookClient::connect(client_config(&server)).unwrap();

    let failed = client
        .search_books(BookFilter::new().with_author_id("author-2"))
        .collect_all();
    assert!(failed.is_err());

    // A scan that matches before the fault still sees its item.
    let mut stream = client.search_books(BookFilter::new().with_id("book-1"));
    assert_eq!(stream.next().unwrap().unwrap().id, "book-1");
    assert!(matches!(stream.next(), Some(Err(StreamError::Internal(_)))));
    assert!(!client.connection().is_closed());
}

// --- Connection Errors ---

#[test]
fn test_connect_to_dead_port_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = BookClient::connect(ClientConfig {
        target: addr.to_string(),
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    });
    assert!(matches!(result, Err(StreamError::Unavailable(_))));
}

#[test]
fn test_unresolvable_target_is_unavailable() {
    let result = BookClient::connect(ClientConfig {
        target: "not a host".to_string(),
        ..Default::default()
    });
    assert!(matches!(result, Err(StreamError::Unavailable(_))));
}

#[test]
fn test_bind_in_use_is_unavailable() {
    let server = start_server(BookService::demo());
    let result = Server::bind(
        ServerConfig {
            bind_addr: server.local_addr().to_string(),
            ..Default::default()
        },
        BookService::demo(),
    );
    assert!(matches!(result, Err(StreamError::Unavailable(_))));
}

// --- Protocol Errors ---

#[test]
fn test_unknown_method_is_unimplemented() {
    let server = start_server(BookService::demo());
    let mut stream = raw_connect(&server);

    send_request(&mut stream, 7, "ListBooks", BookFilter::new().with_id("book-1"), 16);

    match read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).unwrap() {
        Some(Frame::Error { call_id, status }) => {
            assert_eq!(call_id, CallId(7));
            assert_eq!(status.code, StatusCode::Unimplemented);
        }
        other => panic!("expected error frame, got {:?}", other),
    }
}

#[test]
fn test_duplicate_call_id_is_rejected() {
    let (gate_tx, gate) = unbounded();
    let server = start_server(BookService::new(Arc::new(StalledSource { gate })));
    let mut stream = raw_connect(&server);

    send_request(&mut stream, 1, SEARCH_BOOKS, BookFilter::new().with_id("book-0"), 16);
    wait_until("first call to start", || server.active_calls() == 1);
    send_request(&mut stream, 1, SEARCH_BOOKS, BookFilter::new().with_id("book-0"), 16);

    match read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).unwrap() {
        Some(Frame::Error { call_id, status }) => {
            assert_eq!(call_id, CallId(1));
            assert_eq!(status.code, StatusCode::InvalidArgument);
        }
        other => panic!("expected error frame, got {:?}", other),
    }

    drop(gate_tx);
    let mut ids = Vec::new();
    loop {
        match read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).unwrap() {
            Some(Frame::Message { book, .. }) => ids.push(book.id),
            Some(Frame::Completed { call_id }) => {
                assert_eq!(call_id, CallId(1));
                break;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(ids, vec!["book-0"]);
}

#[test]
fn test_messages_wait_for_credit() {
    let server = start_server(BookService::demo());
    let mut stream = raw_connect(&server);

    send_request(&mut stream, 1, SEARCH_BOOKS, BookFilter::new().with_id("book-1"), 0);
    wait_until("call to start", || server.active_calls() == 1);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(server.active_calls(), 1);

    let credit = Frame::Credit {
        call_id: CallId(1),
        n: 1,
    };
    write_frame(&mut stream, &credit, DEFAULT_MAX_FRAME_BYTES).unwrap();

    match read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).unwrap() {
        Some(Frame::Message { call_id, book }) => {
            assert_eq!(call_id, CallId(1));
            assert_eq!(book.id, "book-1");
        }
        other => panic!("expected message frame, got {:?}", other),
    }
    assert!(matches!(
        read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).unwrap(),
        Some(Frame::Completed { call_id: CallId(1) })
    ));
    wait_until("producer to finish", || server.active_calls() == 0);
}

#[test]
fn test_unencodable_result_fails_call_with_internal() {
    let store = BookStore::new();
    let author = Author::new("author-1", "Joshua", "Bloch");
    store.register_author(author.clone()).unwrap();
    store
        .insert(Book::new("big", "x".repeat(200), 100, author.clone()))
        .unwrap();
    store
        .insert(Book::new("small", "Tiny", 100, author))
        .unwrap();

    let server = Server::bind(
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            max_frame_bytes: 160,
        },
        BookService::new(Arc::new(store)),
    )
    .unwrap();
    let client = BookClient::connect(ClientConfig {
        request_deadline: Some(Duration::from_secs(5)),
        ..client_config(&server)
    })
    .unwrap();

    let result = client
        .search_books(BookFilter::new().with_id("big"))
        .collect_all();
    assert!(matches!(result, Err(StreamError::Internal(_))));
    wait_until("producer to stop", || server.active_calls() == 0);

    // The connection stays usable for the next call.
    assert!(!client.connection().is_closed());
    let books = client
        .search_books(BookFilter::new().with_id("small"))
        .collect_all()
        .unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].name, "Tiny");
}

#[test]
fn test_server_exceeding_window_fails_call() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let target = listener.local_addr().unwrap().to_string();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let call_id = match read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).unwrap() {
            Some(Frame::Request { call_id, window, .. }) => {
                assert_eq!(window, 2);
                call_id
            }
            other => panic!("expected request frame, got {:?}", other),
        };
        let author = Author::new("author-1", "Joshua", "Bloch");
        for i in 0..3 {
            let book = Book::new(format!("book-{}", i), "Flood", 100, author.clone());
            let frame = Frame::Message { call_id, book };
            write_frame(&mut stream, &frame, DEFAULT_MAX_FRAME_BYTES).unwrap();
        }
        stream
    });

    let client = BookClient::connect(ClientConfig {
        target,
        buffer_size: 2,
        ..Default::default()
    })
    .unwrap();
    let mut stream = client.search_books(BookFilter::new().with_author_id("author-1"));
    stream.request();
    let _held_open = server.join().unwrap();
    wait_until("call to fail", || client.connection().in_flight() == 0);

    assert_eq!(stream.next().unwrap().unwrap().id, "book-0");
    assert_eq!(stream.next().unwrap().unwrap().id, "book-1");
    assert!(matches!(stream.next(), Some(Err(StreamError::Internal(_)))));
    assert!(stream.next().is_none());
}

#[test]
fn test_corrupt_frame_closes_connection() {
    let server = start_server(BookService::demo());
    let mut stream = raw_connect(&server);

    let body = b"not messagepack";
    let mut frame = Vec::new();
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    frame.extend_from_slice(&0xdead_beefu32.to_le_bytes());
    stream.write_all(&frame).unwrap();

    assert!(read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES)
        .unwrap()
        .is_none());
    wait_until("connection to be dropped", || server.connection_count() == 0);
}

#[test]
fn test_oversized_frame_closes_connection() {
    let server = Server::bind(
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            max_frame_bytes: 64,
        },
        BookService::demo(),
    )
    .unwrap();
    let mut stream = raw_connect(&server);

    stream.write_all(&(1024u32).to_le_bytes()).unwrap();
    assert!(read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES)
        .unwrap()
        .is_none());
}

// --- Deadlines ---

#[test]
fn test_request_deadline_exceeded() {
    let (gate_tx, gate) = unbounded();
    let server = start_server(BookService::new(Arc::new(StalledSource { gate })));
    let client = BookClient::connect(ClientConfig {
        request_deadline: Some(Duration::from_millis(50)),
        ..client_config(&server)
    })
    .unwrap();

    let mut stream = client.search_books(BookFilter::new().with_author_id("author-1"));
    assert!(matches!(stream.next(), Some(Err(StreamError::DeadlineExceeded))));
    assert!(stream.next().is_none());

    wait_until("cancel to reach the server", || server.cancel_requests() == 1);
    drop(gate_tx);
    wait_until("producer to stop", || server.active_calls() == 0);
}

#[test]
fn test_deadline_not_hit_by_fast_call() {
    let server = start_server(BookService::demo());
    let client = BookClient::connect(ClientConfig {
        request_deadline: Some(Duration::from_secs(5)),
        ..client_config(&server)
    })
    .unwrap();

    let books = client
        .search_books(BookFilter::new().with_name("Effective Java"))
        .collect_all()
        .unwrap();
    assert_eq!(books.len(), 1);
}
