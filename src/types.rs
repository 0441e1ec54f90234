//! Core types for the book catalog and search requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A book author.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    /// Unique identifier, immutable once registered.
    pub id: String,
    pub first_name: String,
    pub last_name: String,
}

impl Author {
    pub fn new(
        id: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.first_name, self.last_name)
    }
}

/// A single book in the catalog.
///
/// The author is embedded by value; the store checks that it references a
/// registered author before accepting the book.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    /// Unique identifier.
    pub id: String,

    /// Title.
    pub name: String,

    /// Number of pages (always positive for stored books).
    pub page_count: u32,

    /// Embedded author record.
    pub author: Author,
}

impl Book {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        page_count: u32,
        author: Author,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            page_count,
            author,
        }
    }
}

impl fmt::Display for Book {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" by {} ({} pages)",
            self.id, self.name, self.author, self.page_count
        )
    }
}

/// Search criteria for `SearchBooks`.
///
/// Every field is optional: a blank string or a zero page count means
/// "not specified". A blank string is empty or whitespace only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookFilter {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub page_count: u32,
    #[serde(default)]
    pub author_id: String,
}

impl BookFilter {
    /// A filter with every field unset. Matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_page_count(mut self, page_count: u32) -> Self {
        self.page_count = page_count;
        self
    }

    pub fn with_author_id(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = author_id.into();
        self
    }

    /// True when no field is specified.
    pub fn is_unset(&self) -> bool {
        is_blank(&self.id)
            && is_blank(&self.name)
            && self.page_count == 0
            && is_blank(&self.author_id)
    }
}

/// Empty or whitespace-only.
pub(crate) fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}
