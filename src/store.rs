//! In-memory book catalog.
//!
//! The catalog is read far more often than it is written. Books live in an
//! `Arc<Vec<Book>>` snapshot that readers clone under a short read lock;
//! writers build a new vector and swap it in, so a scan that is already
//! running keeps seeing the catalog as it was when the scan started.

use crate::error::{Result, StreamError};
use crate::types::{is_blank, Author, Book};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Lazily evaluated, ordered scan over the records of a source.
pub type RecordScan = Box<dyn Iterator<Item = Result<Book>> + Send>;

/// Anything the search producer can iterate.
///
/// `scan` itself may fail (the source is unreachable), and so may each step
/// of the returned iterator.
pub trait RecordSource: Send + Sync {
    fn scan(&self) -> Result<RecordScan>;
}

#[derive(Default)]
struct Catalog {
    /// Authors in registration order.
    authors: Vec<Author>,
    /// Author ID to position in `authors`.
    author_index: HashMap<String, usize>,
    /// Books in insertion order.
    books: Arc<Vec<Book>>,
    /// Known book IDs.
    book_ids: HashSet<String>,
}

impl Catalog {
    fn add_author(&mut self, author: Author) -> Result<()> {
        if is_blank(&author.id) {
            return Err(StreamError::InvalidArgument("author id is required".into()));
        }
        if self.author_index.contains_key(&author.id) {
            return Err(StreamError::AuthorExists(author.id));
        }

        self.author_index.insert(author.id.clone(), self.authors.len());
        self.authors.push(author);
        Ok(())
    }

    /// Whether `book` may join the catalog.
    fn check_book(&self, book: &Book) -> Result<()> {
        if is_blank(&book.id) {
            return Err(StreamError::InvalidArgument("book id is required".into()));
        }
        // Zero is the filter's "unset" marker, such a book could never be found by page count.
        if book.page_count == 0 {
            return Err(StreamError::InvalidArgument(format!(
                "book {} must have a positive page count",
                book.id
            )));
        }
        if !self.author_index.contains_key(&book.author.id) {
            return Err(StreamError::InvalidArgument(format!(
                "book {} references unknown author {}",
                book.id, book.author.id
            )));
        }
        if self.book_ids.contains(&book.id) {
            return Err(StreamError::BookExists(book.id.clone()));
        }
        Ok(())
    }
}

/// The book catalog.
pub struct BookStore {
    catalog: RwLock<Catalog>,
}

impl BookStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
        }
    }

    /// Create a store from authors and books, validating every book.
    pub fn with_catalog(
        authors: impl IntoIterator<Item = Author>,
        books: impl IntoIterator<Item = Book>,
    ) -> Result<Self> {
        let mut catalog = Catalog::default();
        for author in authors {
            catalog.add_author(author)?;
        }

        let mut loaded = Vec::new();
        for book in books {
            catalog.check_book(&book)?;
            catalog.book_ids.insert(book.id.clone());
            loaded.push(book);
        }
        catalog.books = Arc::new(loaded);

        Ok(Self {
            catalog: RwLock::new(catalog),
        })
    }

    /// The sample catalog served by the demo server.
    pub fn demo() -> Self {
        let authors = demo_authors();
        let books = vec![
            Book::new("book-1", "Effective Java", 416, authors[0].clone()),
            Book::new(
                "book-2",
                "Hitchhiker's Guide to the Galaxy",
                208,
                authors[1].clone(),
            ),
            Book::new("book-3", "Down Under", 436, authors[2].clone()),
        ];

        let mut author_index = HashMap::new();
        for (i, author) in authors.iter().enumerate() {
            author_index.insert(author.id.clone(), i);
        }
        let book_ids = books.iter().map(|b| b.id.clone()).collect();

        Self {
            catalog: RwLock::new(Catalog {
                authors,
                author_index,
                books: Arc::new(books),
                book_ids,
            }),
        }
    }

    // --- Reads ---

    /// All books in insertion order.
    ///
    /// The returned snapshot is unaffected by later mutations.
    pub fn all_records(&self) -> Arc<Vec<Book>> {
        Arc::clone(&self.catalog.read().books)
    }

    /// All registered authors in registration order.
    pub fn authors(&self) -> Vec<Author> {
        self.catalog.read().authors.clone()
    }

    pub fn get_author(&self, id: &str) -> Option<Author> {
        let catalog = self.catalog.read();
        catalog
            .author_index
            .get(id)
            .map(|&i| catalog.authors[i].clone())
    }

    pub fn get_book(&self, id: &str) -> Option<Book> {
        self.catalog
            .read()
            .books
            .iter()
            .find(|b| b.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.catalog.read().books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- Writes ---

    /// Register an author so books may reference it.
    pub fn register_author(&self, author: Author) -> Result<()> {
        self.catalog.write().add_author(author)
    }

    /// Append a book to the catalog.
    ///
    /// The book must have a non-blank ID, a positive page count, and an
    /// author that is already registered.
    pub fn insert(&self, book: Book) -> Result<()> {
        let mut catalog = self.catalog.write();
        catalog.check_book(&book)?;

        let mut books = Vec::with_capacity(catalog.books.len() + 1);
        books.extend(catalog.books.iter().cloned());
        catalog.book_ids.insert(book.id.clone());
        books.push(book);
        catalog.books = Arc::new(books);
        Ok(())
    }

    /// Remove a book, returning it.
    pub fn remove(&self, id: &str) -> Result<Book> {
        let mut catalog = self.catalog.write();
        let position = catalog
            .books
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| StreamError::BookNotFound(id.to_string()))?;

        let mut books: Vec<Book> = catalog.books.as_ref().clone();
        let removed = books.remove(position);
        catalog.book_ids.remove(id);
        catalog.books = Arc::new(books);
        Ok(removed)
    }
}

impl Default for BookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSource for BookStore {
    fn scan(&self) -> Result<RecordScan> {
        Ok(Box::new(SnapshotScan {
            books: self.all_records(),
            position: 0,
        }))
    }
}

/// Iterator over one catalog snapshot.
struct SnapshotScan {
    books: Arc<Vec<Book>>,
    position: usize,
}

impl Iterator for SnapshotScan {
    type Item = Result<Book>;

    fn next(&mut self) -> Option<Self::Item> {
        let book = self.books.get(self.position)?.clone();
        self.position += 1;
        Some(Ok(book))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.books.len() - self.position;
        (remaining, Some(remaining))
    }
}

fn demo_authors() -> Vec<Author> {
    vec![
        Author::new("author-1", "Joshua", "Bloch"),
        Author::new("author-2", "Douglas", "Adams"),
        Author::new("author-3", "Bill", "Bryson"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(books: &[Book]) -> Vec<&str> {
        books.iter().map(|b| b.id.as_str()).collect()
    }

    #[test]
    fn test_demo_catalog_order() {
        let store = BookStore::demo();
        assert_eq!(store.len(), 3);
        assert_eq!(ids(&store.all_records()), vec!["book-1", "book-2", "book-3"]);
        assert_eq!(store.authors().len(), 3);
        assert_eq!(store.get_author("author-2").unwrap().last_name, "Adams");
    }

    #[test]
    fn test_order_stable_across_calls() {
        let store = BookStore::demo();
        let first = store.all_records();
        let second = store.all_records();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_insert_validates_author() {
        let store = BookStore::new();
        let ghost = Author::new("author-9", "No", "Body");
        let result = store.insert(Book::new("book-1", "Orphan", 10, ghost));
        assert!(matches!(result, Err(StreamError::InvalidArgument(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_insert_rejects_zero_pages_and_duplicates() {
        let store = BookStore::demo();
        let author = store.get_author("author-1").unwrap();

        let zero = store.insert(Book::new("book-4", "Empty", 0, author.clone()));
        assert!(matches!(zero, Err(StreamError::InvalidArgument(_))));

        let dup = store.insert(Book::new("book-1", "Again", 1, author));
        assert!(matches!(dup, Err(StreamError::BookExists(_))));
    }

    #[test]
    fn test_register_duplicate_author() {
        let store = BookStore::demo();
        let result = store.register_author(Author::new("author-1", "J", "B"));
        assert!(matches!(result, Err(StreamError::AuthorExists(_))));
    }

    #[test]
    fn test_snapshot_isolated_from_mutation() {
        let store = BookStore::demo();
        let mut scan = store.scan().unwrap();
        assert_eq!(scan.next().unwrap().unwrap().id, "book-1");

        store.remove("book-2").unwrap();
        let author = store.get_author("author-3").unwrap();
        store
            .insert(Book::new("book-4", "Notes from a Small Island", 324, author))
            .unwrap();

        // The running scan still sees the old catalog.
        let rest: Vec<String> = scan.map(|b| b.unwrap().id).collect();
        assert_eq!(rest, vec!["book-2", "book-3"]);

        assert_eq!(ids(&store.all_records()), vec!["book-1", "book-3", "book-4"]);
    }

    #[test]
    fn test_blank_ids_rejected() {
        let store = BookStore::new();
        let blank_author = store.register_author(Author::new("  ", "No", "Id"));
        assert!(matches!(blank_author, Err(StreamError::InvalidArgument(_))));

        store.register_author(Author::new("author-1", "Joshua", "Bloch")).unwrap();
        let author = store.get_author("author-1").unwrap();
        let blank_book = store.insert(Book::new("", "Untitled", 10, author));
        assert!(matches!(blank_book, Err(StreamError::InvalidArgument(_))));
    }

    #[test]
    fn test_with_catalog_loads_in_order() {
        let author = Author::new("author-1", "Joshua", "Bloch");
        let books = (1..=3).map(|i| Book::new(format!("book-{}", i), "Volume", 100, author.clone()));
        let store = BookStore::with_catalog(vec![author.clone()], books).unwrap();
        assert_eq!(ids(&store.all_records()), vec!["book-1", "book-2", "book-3"]);

        let dup = BookStore::with_catalog(
            vec![author.clone()],
            vec![
                Book::new("book-1", "Volume", 100, author.clone()),
                Book::new("book-1", "Volume", 100, author),
            ],
        );
        assert!(matches!(dup, Err(StreamError::BookExists(_))));
    }

    #[test]
    fn test_remove_missing() {
        let store = BookStore::demo();
        assert!(matches!(
            store.remove("book-9"),
            Err(StreamError::BookNotFound(_))
        ));
    }
}
