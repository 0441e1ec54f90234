//! Server-side `SearchBooks` producer.

use crate::error::StreamError;
use crate::matcher::is_match;
use crate::store::{BookStore, RecordSource};
use crate::stream::StreamObserver;
use crate::types::{Book, BookFilter};
use std::sync::Arc;
use tracing::{debug, warn};

/// How a search ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Every record was evaluated and completion was signalled.
    Completed { matched: usize, scanned: usize },
    /// An error event was emitted.
    Failed { matched: usize, scanned: usize },
    /// The observer went away; nothing was signalled.
    Cancelled { matched: usize, scanned: usize },
}

/// The book search service.
#[derive(Clone)]
pub struct BookService {
    source: Arc<dyn RecordSource>,
}

impl BookService {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self { source }
    }

    /// Service over the demo catalog.
    pub fn demo() -> Self {
        Self::new(Arc::new(BookStore::demo()))
    }

    /// Stream every book matching `filter` into `observer`, in store order.
    ///
    /// Emits zero or more `on_next` calls followed by exactly one
    /// `on_completed` or `on_error`, unless the observer is cancelled, in
    /// which case emission stops without a terminal event. Cancellation is
    /// checked before each record is evaluated.
    pub fn search_books(
        &self,
        filter: &BookFilter,
        observer: &mut dyn StreamObserver<Book>,
    ) -> SearchOutcome {
        let mut matched = 0;
        let mut scanned = 0;

        let scan = match self.source.scan() {
            Ok(scan) => scan,
            Err(e) => {
                warn!(error = %e, "record scan could not be opened");
                observer.on_error(internal(e));
                return SearchOutcome::Failed { matched, scanned };
            }
        };

        for item in scan {
            if observer.is_cancelled() {
                debug!(matched, scanned, "search cancelled");
                return SearchOutcome::Cancelled { matched, scanned };
            }

            let book = match item {
                Ok(book) => book,
                Err(e) => {
                    warn!(error = %e, matched, scanned, "record scan failed");
                    observer.on_error(internal(e));
                    return SearchOutcome::Failed { matched, scanned };
                }
            };
            scanned += 1;

            if is_match(filter, &book) {
                matched += 1;
                observer.on_next(book);
            }
        }

        if observer.is_cancelled() {
            debug!(matched, scanned, "search cancelled");
            return SearchOutcome::Cancelled { matched, scanned };
        }

        observer.on_completed();
        debug!(matched, scanned, "search completed");
        SearchOutcome::Completed { matched, scanned }
    }
}

/// Faults from the record source surface as `Internal` unless they already
/// carry a transport-level classification.
fn internal(error: StreamError) -> StreamError {
    match error {
        e @ (StreamError::Internal(_)
        | StreamError::Unavailable(_)
        | StreamError::DeadlineExceeded) => e,
        other => StreamError::Internal(other.to_string()),
    }
}
