//! Filter matching.
//!
//! A book matches when ANY specified filter field equals the corresponding
//! book field. Unspecified fields (blank strings, zero page count) take no
//! part in the decision, so a filter with nothing specified matches nothing.

use crate::types::{is_blank, Book, BookFilter};

/// Check whether `book` satisfies `filter`.
pub fn is_match(filter: &BookFilter, book: &Book) -> bool {
    let mut matched = false;

    if !is_blank(&filter.id) {
        matched |= book.id == filter.id;
    }

    if !is_blank(&filter.name) {
        matched |= book.name == filter.name;
    }

    if filter.page_count > 0 {
        matched |= book.page_count == filter.page_count;
    }

    if !is_blank(&filter.author_id) {
        matched |= book.author.id == filter.author_id;
    }

    matched
}

/// Books from `books` that satisfy `filter`, in order.
pub fn matching<'a, I>(filter: &'a BookFilter, books: I) -> impl Iterator<Item = &'a Book> + 'a
where
    I: IntoIterator<Item = &'a Book>,
    I::IntoIter: 'a,
{
    books.into_iter().filter(move |book| is_match(filter, book))
}
