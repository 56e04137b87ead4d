//! The syncable book entity.

use crate::id::EntityId;
use serde::{Deserialize, Serialize};
use shelfsync_model::SystemFields;
use std::collections::BTreeSet;
use std::fmt;

/// Keys under which book fields are stored in a remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKey {
    /// Book title.
    Title,
    /// Book subtitle.
    Subtitle,
    /// External catalog identifier.
    GoogleBooksId,
    /// Locally generated identifier for manually entered books.
    ManualBookId,
    /// ISBN-13.
    Isbn13,
    /// Page count.
    PageCount,
    /// Publication date.
    PublicationDate,
    /// Description.
    BookDescription,
    /// User notes.
    Notes,
    /// Current reading page.
    CurrentPage,
    /// ISO 639-1 language code.
    LanguageCode,
    /// User rating.
    Rating,
    /// Manual sort index.
    Sort,
    /// Start and finish dates.
    ReadDates,
    /// Serialized author list.
    Authors,
    /// Cover image bytes.
    CoverImage,
}

impl RecordKey {
    /// Every key, in table order.
    pub const ALL: [RecordKey; 16] = [
        RecordKey::Title,
        RecordKey::Subtitle,
        RecordKey::GoogleBooksId,
        RecordKey::ManualBookId,
        RecordKey::Isbn13,
        RecordKey::PageCount,
        RecordKey::PublicationDate,
        RecordKey::BookDescription,
        RecordKey::Notes,
        RecordKey::CurrentPage,
        RecordKey::LanguageCode,
        RecordKey::Rating,
        RecordKey::Sort,
        RecordKey::ReadDates,
        RecordKey::Authors,
        RecordKey::CoverImage,
    ];

    /// Returns the key as stored remotely.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKey::Title => "title",
            RecordKey::Subtitle => "subtitle",
            RecordKey::GoogleBooksId => "googleBooksId",
            RecordKey::ManualBookId => "manualBookId",
            RecordKey::Isbn13 => "isbn13",
            RecordKey::PageCount => "pageCount",
            RecordKey::PublicationDate => "publicationDate",
            RecordKey::BookDescription => "bookDescription",
            RecordKey::Notes => "notes",
            RecordKey::CurrentPage => "currentPage",
            RecordKey::LanguageCode => "languageCode",
            RecordKey::Rating => "rating",
            RecordKey::Sort => "sort",
            RecordKey::ReadDates => "readDates",
            RecordKey::Authors => "authors",
            RecordKey::CoverImage => "coverImage",
        }
    }

    /// Parses a remote key. Unknown keys yield `None`.
    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reading progress of a book. Dates are seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadState {
    /// Not started.
    #[default]
    ToRead,
    /// Started but not finished.
    Reading {
        /// When reading started.
        started: i64,
    },
    /// Finished.
    Finished {
        /// When reading started.
        started: i64,
        /// When reading finished.
        finished: i64,
    },
}

/// A book author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Last name.
    pub last_name: String,
    /// First names, if known.
    pub first_names: Option<String>,
}

impl Author {
    /// Creates an author.
    pub fn new(last_name: impl Into<String>, first_names: Option<&str>) -> Self {
        Self {
            last_name: last_name.into(),
            first_names: first_names.map(str::to_owned),
        }
    }
}

/// A book in the local store.
///
/// `remote_identifier` is set only once the book is known to exist remotely,
/// either because a push succeeded or because it was downloaded. A book with
/// no remote identifier has only ever existed locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    /// Local identity.
    pub id: EntityId,
    /// Title.
    pub title: String,
    /// Subtitle.
    pub subtitle: Option<String>,
    /// External catalog identifier.
    pub google_books_id: Option<String>,
    /// Local identifier for books entered by hand.
    pub manual_book_id: Option<String>,
    /// ISBN-13.
    pub isbn13: Option<i64>,
    /// Page count.
    pub page_count: Option<i32>,
    /// Publication date (seconds since the Unix epoch).
    pub publication_date: Option<i64>,
    /// Description.
    pub description: Option<String>,
    /// User notes.
    pub notes: Option<String>,
    /// Current reading page.
    pub current_page: Option<i32>,
    /// ISO 639-1 language code.
    pub language_code: Option<String>,
    /// User rating.
    pub rating: Option<i16>,
    /// Manual sort index.
    pub sort: i32,
    /// Reading progress.
    pub read_state: ReadState,
    /// Ordered authors.
    pub authors: Vec<Author>,
    /// Cover image bytes.
    pub cover_image: Option<Vec<u8>>,
    /// Name of the corresponding remote record.
    pub remote_identifier: Option<String>,
    /// Remote metadata from the last push or download.
    pub encoded_system_fields: Option<SystemFields>,
    /// Keys edited locally and not yet confirmed by the remote.
    pub pending_remote_keys: BTreeSet<RecordKey>,
    /// Deleted locally, awaiting remote deletion.
    pub pending_remote_deletion: bool,
}

macro_rules! pending_setter {
    ($(#[$doc:meta])* $name:ident, $field:ident: $ty:ty => $key:expr) => {
        $(#[$doc])*
        pub fn $name(&mut self, value: $ty) {
            self.$field = value;
            self.mark_pending($key);
        }
    };
}

impl Book {
    /// Remote record type of books.
    pub const RECORD_TYPE: &'static str = "Book";

    /// Creates an empty book with a fresh local identity.
    ///
    /// Used when a remote record has no local counterpart yet.
    pub fn blank() -> Self {
        Self {
            id: EntityId::new(),
            title: String::new(),
            subtitle: None,
            google_books_id: None,
            manual_book_id: None,
            isbn13: None,
            page_count: None,
            publication_date: None,
            description: None,
            notes: None,
            current_page: None,
            language_code: None,
            rating: None,
            sort: 0,
            read_state: ReadState::ToRead,
            authors: Vec::new(),
            cover_image: None,
            remote_identifier: None,
            encoded_system_fields: None,
            pending_remote_keys: BTreeSet::new(),
            pending_remote_deletion: false,
        }
    }

    /// Creates a manually entered book. Its manual identifier is its UUID.
    pub fn new_manual(title: impl Into<String>) -> Self {
        let mut book = Self::blank();
        book.title = title.into();
        book.manual_book_id = Some(book.id.to_string());
        book
    }

    /// Creates a book sourced from the external catalog.
    pub fn from_catalog(google_books_id: impl Into<String>, title: impl Into<String>) -> Self {
        let mut book = Self::blank();
        book.title = title.into();
        book.google_books_id = Some(google_books_id.into());
        book
    }

    /// Records that `key` was edited locally.
    pub fn mark_pending(&mut self, key: RecordKey) {
        self.pending_remote_keys.insert(key);
    }

    /// Returns true if the book has edits the remote has not confirmed.
    pub fn has_pending_remote_keys(&self) -> bool {
        !self.pending_remote_keys.is_empty()
    }

    /// Copies onto `self` every field that `edited` changed relative to
    /// `base`, leaving the other fields as they are.
    ///
    /// Pending keys are merged as a set: keys `edited` added are added, keys
    /// it removed are removed, and keys added here since `base` are kept.
    pub fn apply_edits(&mut self, base: &Book, edited: &Book) {
        macro_rules! edited_fields {
            ($($field:ident),* $(,)?) => {
                $(
                    if edited.$field != base.$field {
                        self.$field = edited.$field.clone();
                    }
                )*
            };
        }
        edited_fields!(
            title,
            subtitle,
            google_books_id,
            manual_book_id,
            isbn13,
            page_count,
            publication_date,
            description,
            notes,
            current_page,
            language_code,
            rating,
            sort,
            read_state,
            authors,
            cover_image,
            remote_identifier,
            encoded_system_fields,
            pending_remote_deletion,
        );

        for key in edited.pending_remote_keys.difference(&base.pending_remote_keys) {
            self.pending_remote_keys.insert(*key);
        }
        for key in base.pending_remote_keys.difference(&edited.pending_remote_keys) {
            self.pending_remote_keys.remove(key);
        }
    }

    pending_setter!(
        /// Sets the title.
        set_title, title: String => RecordKey::Title
    );
    pending_setter!(
        /// Sets the subtitle.
        set_subtitle, subtitle: Option<String> => RecordKey::Subtitle
    );
    pending_setter!(
        /// Sets the ISBN-13.
        set_isbn13, isbn13: Option<i64> => RecordKey::Isbn13
    );
    pending_setter!(
        /// Sets the page count.
        set_page_count, page_count: Option<i32> => RecordKey::PageCount
    );
    pending_setter!(
        /// Sets the publication date.
        set_publication_date, publication_date: Option<i64> => RecordKey::PublicationDate
    );
    pending_setter!(
        /// Sets the description.
        set_description, description: Option<String> => RecordKey::BookDescription
    );
    pending_setter!(
        /// Sets the notes.
        set_notes, notes: Option<String> => RecordKey::Notes
    );
    pending_setter!(
        /// Sets the current page.
        set_current_page, current_page: Option<i32> => RecordKey::CurrentPage
    );
    pending_setter!(
        /// Sets the language code.
        set_language_code, language_code: Option<String> => RecordKey::LanguageCode
    );
    pending_setter!(
        /// Sets the rating.
        set_rating, rating: Option<i16> => RecordKey::Rating
    );
    pending_setter!(
        /// Sets the sort index.
        set_sort, sort: i32 => RecordKey::Sort
    );
    pending_setter!(
        /// Sets the reading progress.
        set_read_state, read_state: ReadState => RecordKey::ReadDates
    );
    pending_setter!(
        /// Sets the authors.
        set_authors, authors: Vec<Author> => RecordKey::Authors
    );
    pending_setter!(
        /// Sets the cover image.
        set_cover_image, cover_image: Option<Vec<u8>> => RecordKey::CoverImage
    );
}
