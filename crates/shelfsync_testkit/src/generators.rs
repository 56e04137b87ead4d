//! Property-based test generators using proptest.
//!
//! Provides strategies for generating books that keep the store's
//! invariants: every book has exactly one local identity source, and
//! read dates are ordered.

use proptest::prelude::*;
use shelfsync_store::{Author, Book, ReadState, RecordKey};
use std::collections::BTreeSet;

/// Strategy for generating titles.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9 ]{0,31}").expect("Invalid regex")
}

/// Strategy for generating optional free text.
pub fn optional_text_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of(prop::string::string_regex("[a-z ]{1,40}").expect("Invalid regex"))
}

/// Strategy for generating catalog identifiers.
pub fn google_books_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z0-9_-]{12}").expect("Invalid regex")
}

/// Strategy for generating authors.
pub fn author_strategy() -> impl Strategy<Value = Author> {
    (
        prop::string::string_regex("[A-Z][a-z]{1,15}").expect("Invalid regex"),
        prop::option::of(prop::string::string_regex("[A-Z][a-z]{1,15}").expect("Invalid regex")),
    )
        .prop_map(|(last, first)| Author::new(last, first.as_deref()))
}

/// Strategy for generating reading progress with ordered dates.
pub fn read_state_strategy() -> impl Strategy<Value = ReadState> {
    prop_oneof![
        Just(ReadState::ToRead),
        (0i64..2_000_000_000).prop_map(|started| ReadState::Reading { started }),
        (0i64..2_000_000_000, 0i64..10_000_000).prop_map(|(started, days)| {
            ReadState::Finished {
                started,
                finished: started + days,
            }
        }),
    ]
}

/// Strategy for generating record keys.
pub fn record_key_strategy() -> impl Strategy<Value = RecordKey> {
    prop::sample::select(RecordKey::ALL.to_vec())
}

/// Strategy for generating sets of pending keys.
pub fn pending_keys_strategy() -> impl Strategy<Value = BTreeSet<RecordKey>> {
    prop::collection::btree_set(record_key_strategy(), 0..6)
}

/// Strategy for generating books with no sync bookkeeping.
pub fn book_strategy() -> impl Strategy<Value = Book> {
    (
        prop::option::of(google_books_id_strategy()),
        title_strategy(),
        optional_text_strategy(),
        optional_text_strategy(),
        prop::option::of(1i32..2000),
        prop::option::of(9_780_000_000_000i64..9_800_000_000_000),
        prop::option::of(1i16..=5),
        read_state_strategy(),
        prop::collection::vec(author_strategy(), 0..4),
        -100i32..100,
    )
        .prop_map(
            |(gbid, title, subtitle, notes, page_count, isbn13, rating, read_state, authors, sort)| {
                let mut book = match gbid {
                    Some(gbid) => Book::from_catalog(gbid, title),
                    None => Book::new_manual(title),
                };
                book.subtitle = subtitle;
                book.notes = notes;
                book.page_count = page_count;
                book.isbn13 = isbn13;
                book.rating = rating;
                book.read_state = read_state;
                book.authors = authors;
                book.sort = sort;
                book
            },
        )
}
