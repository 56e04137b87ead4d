//! Declarative book predicates.
//!
//! A single [`Predicate`] value is both the in-memory check applied to one
//! book and the filter of a bulk fetch, so the two can never disagree.

use crate::book::Book;

/// A filter over books.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Matches every book.
    True,
    /// Matches no book.
    False,
    /// The book has never been seen by the remote.
    RemoteIdentifierIsNull,
    /// The book's remote identifier equals the given record name.
    RemoteIdentifierEquals(String),
    /// The book's remote identifier is one of the given record names.
    RemoteIdentifierIn(Vec<String>),
    /// The book's catalog identifier equals the given value.
    GoogleBooksIdEquals(String),
    /// The book's manual identifier equals the given value.
    ManualBookIdEquals(String),
    /// The book has local edits the remote has not confirmed.
    HasPendingRemoteKeys,
    /// The book was deleted locally and awaits remote deletion.
    PendingRemoteDeletion,
    /// Negation.
    Not(Box<Predicate>),
    /// Conjunction; an empty list matches everything.
    And(Vec<Predicate>),
    /// Disjunction; an empty list matches nothing.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Evaluates the predicate against one book.
    pub fn evaluate(&self, book: &Book) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::RemoteIdentifierIsNull => book.remote_identifier.is_none(),
            Predicate::RemoteIdentifierEquals(name) => {
                book.remote_identifier.as_deref() == Some(name.as_str())
            }
            Predicate::RemoteIdentifierIn(names) => book
                .remote_identifier
                .as_ref()
                .is_some_and(|id| names.contains(id)),
            Predicate::GoogleBooksIdEquals(id) => {
                book.google_books_id.as_deref() == Some(id.as_str())
            }
            Predicate::ManualBookIdEquals(id) => {
                book.manual_book_id.as_deref() == Some(id.as_str())
            }
            Predicate::HasPendingRemoteKeys => book.has_pending_remote_keys(),
            Predicate::PendingRemoteDeletion => book.pending_remote_deletion,
            Predicate::Not(inner) => !inner.evaluate(book),
            Predicate::And(all) => all.iter().all(|p| p.evaluate(book)),
            Predicate::Or(any) => any.iter().any(|p| p.evaluate(book)),
        }
    }

    /// Combines with `other` by conjunction.
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::And(mut all) => {
                all.push(other);
                Predicate::And(all)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Combines with `other` by disjunction.
    pub fn or(self, other: Predicate) -> Predicate {
        match self {
            Predicate::Or(mut any) => {
                any.push(other);
                Predicate::Or(any)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    /// Negates the predicate.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

/// A bulk fetch of books.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Filter applied to every book.
    pub predicate: Predicate,
    /// Maximum number of books returned.
    pub limit: Option<usize>,
}

impl FetchRequest {
    /// Fetches every book matching `predicate`.
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            limit: None,
        }
    }

    /// Caps the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
