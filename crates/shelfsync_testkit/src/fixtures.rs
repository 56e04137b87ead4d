//! Test fixtures and store helpers.
//!
//! Provides convenience builders for books and remote records, and
//! temporary stores that clean up after themselves.

use shelfsync_model::{to_cbor, RecordId, RecordValue, RemoteRecord, SystemFields, ZoneId};
use shelfsync_store::{Author, Book, PersistentStore, ReadState, RecordKey};
use std::path::PathBuf;
use std::sync::Once;
use tempfile::TempDir;

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: PersistentStore,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory() -> Self {
        Self {
            store: PersistentStore::open_in_memory(),
            _temp_dir: None,
        }
    }

    /// Creates a new file-backed test store.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("library.cbor");
        let store = PersistentStore::open(&path).expect("Failed to open file store");
        Self {
            store,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the snapshot path if file-backed, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir
            .as_ref()
            .map(|d| d.path().join("library.cbor"))
    }

    /// Reopens the snapshot file as a fresh store.
    pub fn reopen(&self) -> PersistentStore {
        let path = self.path().expect("Only file stores can be reopened");
        PersistentStore::open(path).expect("Failed to reopen file store")
    }
}

impl std::ops::Deref for TestStore {
    type Target = PersistentStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Builds books for tests.
///
/// Fields set through the builder are not marked pending; use
/// [`BookBuilder::pending`] to simulate unconfirmed local edits.
pub struct BookBuilder {
    book: Book,
}

impl BookBuilder {
    /// Starts a manually entered book.
    pub fn manual(title: &str) -> Self {
        Self {
            book: Book::new_manual(title),
        }
    }

    /// Starts a catalog book.
    pub fn catalog(google_books_id: &str, title: &str) -> Self {
        Self {
            book: Book::from_catalog(google_books_id, title),
        }
    }

    /// Sets the notes.
    pub fn notes(mut self, notes: &str) -> Self {
        self.book.notes = Some(notes.to_owned());
        self
    }

    /// Sets the authors from `(last, first)` pairs.
    pub fn authors(mut self, authors: &[(&str, Option<&str>)]) -> Self {
        self.book.authors = authors
            .iter()
            .map(|(last, first)| Author::new(*last, *first))
            .collect();
        self
    }

    /// Sets the reading progress.
    pub fn read_state(mut self, read_state: ReadState) -> Self {
        self.book.read_state = read_state;
        self
    }

    /// Sets the remote identifier and system fields, as if downloaded.
    pub fn synced(mut self, record_name: &str) -> Self {
        self.book.remote_identifier = Some(record_name.to_owned());
        self.book.encoded_system_fields = Some(SystemFields::from_bytes(b"tag-0".to_vec()));
        self
    }

    /// Marks a key as edited and unconfirmed.
    pub fn pending(mut self, key: RecordKey) -> Self {
        self.book.mark_pending(key);
        self
    }

    /// Flags the book for remote deletion.
    pub fn pending_deletion(mut self) -> Self {
        self.book.pending_remote_deletion = true;
        self
    }

    /// Returns the book.
    pub fn build(self) -> Book {
        self.book
    }
}

/// Builds remote book records for tests.
pub struct RecordBuilder {
    record: RemoteRecord,
}

impl RecordBuilder {
    /// Starts a book record.
    pub fn book(zone: &str, name: &str) -> Self {
        let id = RecordId::new(ZoneId::new(zone), name);
        Self {
            record: RemoteRecord::new(id, Book::RECORD_TYPE),
        }
    }

    /// Sets a text field.
    pub fn text(mut self, key: RecordKey, value: &str) -> Self {
        self.record
            .set(key.as_str(), Some(RecordValue::Text(value.to_owned())));
        self
    }

    /// Sets an integer field.
    pub fn integer(mut self, key: RecordKey, value: i64) -> Self {
        self.record
            .set(key.as_str(), Some(RecordValue::Integer(value)));
        self
    }

    /// Sets the read dates.
    pub fn read_dates(mut self, dates: &[i64]) -> Self {
        let dates = dates.iter().map(|d| RecordValue::Timestamp(*d)).collect();
        self.record
            .set(RecordKey::ReadDates.as_str(), Some(RecordValue::List(dates)));
        self
    }

    /// Sets the encoded authors.
    pub fn authors(mut self, authors: &[Author]) -> Self {
        let encoded = to_cbor(authors).expect("Failed to encode authors");
        self.record
            .set(RecordKey::Authors.as_str(), Some(RecordValue::Bytes(encoded)));
        self
    }

    /// Sets a raw bytes field.
    pub fn bytes(mut self, key: RecordKey, value: &[u8]) -> Self {
        self.record
            .set(key.as_str(), Some(RecordValue::Bytes(value.to_vec())));
        self
    }

    /// Sets the system fields.
    pub fn system_fields(mut self, tag: &[u8]) -> Self {
        self.record.system_fields = Some(SystemFields::from_bytes(tag.to_vec()));
        self
    }

    /// Returns the record.
    pub fn build(self) -> RemoteRecord {
        self.record
    }
}

static TRACING: Once = Once::new();

/// Installs a test log subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `shelfsync=debug`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shelfsync=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_has_path() {
        let store = TestStore::file();
        assert!(store.path().is_some());
        assert!(TestStore::memory().path().is_none());
    }

    #[test]
    fn builder_fields_are_not_pending() {
        let book = BookBuilder::catalog("abc", "Foo")
            .notes("bar")
            .authors(&[("Le Guin", Some("Ursula"))])
            .build();
        assert!(!book.has_pending_remote_keys());
        assert_eq!(book.authors.len(), 1);

        let book = BookBuilder::manual("Foo").pending(RecordKey::Notes).build();
        assert!(book.has_pending_remote_keys());
    }

    #[test]
    fn record_builder_sets_type() {
        let record = RecordBuilder::book("Books", "gbid:abc")
            .text(RecordKey::Title, "Foo")
            .build();
        assert_eq!(record.record_type, Book::RECORD_TYPE);
        assert_eq!(record.name(), "gbid:abc");
    }
}
