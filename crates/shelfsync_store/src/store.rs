//! Durable snapshot of books and change tokens.

use crate::book::Book;
use crate::change_token::ChangeToken;
use crate::error::{StoreError, StoreResult};
use crate::id::EntityId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shelfsync_model::{from_cbor, to_cbor, ZoneId};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const TEMP_SUFFIX: &str = "tmp";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    books: BTreeMap<EntityId, Book>,
    change_tokens: BTreeMap<ZoneId, ChangeToken>,
    sequence: u64,
}

/// Edits made to a book in a working copy.
///
/// Only the fields that differ between `base` and `book` are written, so a
/// copy that missed another copy's save never rolls those fields back.
#[derive(Debug, Clone, PartialEq)]
pub struct BookUpdate {
    /// The book as the working copy last loaded it.
    pub base: Book,
    /// The book as edited.
    pub book: Book,
}

/// A set of writes committed together.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    /// Books to insert or replace.
    pub upserts: Vec<Book>,
    /// Field-level edits to existing books.
    pub updates: Vec<BookUpdate>,
    /// Books to remove.
    pub deletes: Vec<EntityId>,
    /// Change tokens to insert or replace.
    pub token_upserts: Vec<ChangeToken>,
    /// Zones whose change token is removed.
    pub token_deletes: Vec<ZoneId>,
}

impl Changeset {
    /// Returns true if the changeset writes nothing.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.token_upserts.is_empty()
            && self.token_deletes.is_empty()
    }
}

struct StoreInner {
    snapshot: RwLock<Snapshot>,
    path: Option<PathBuf>,
    read_only: AtomicBool,
}

/// The durable store shared by every working copy.
///
/// Cloning is cheap; clones share the same underlying state.
///
/// A commit:
/// - Applies all of its writes or none of them
/// - Writes only the fields an update changed
/// - Is persisted (when file-backed) before it becomes visible
/// - Advances the commit sequence by one
#[derive(Clone)]
pub struct PersistentStore {
    inner: Arc<StoreInner>,
}

impl PersistentStore {
    /// Opens a store that lives only in memory.
    pub fn open_in_memory() -> Self {
        Self::with_snapshot(Snapshot::default(), None)
    }

    /// Opens a file-backed store, creating it if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let data = fs::read(&path)?;
            if data.is_empty() {
                Snapshot::default()
            } else {
                from_cbor(&data)?
            }
        } else {
            Snapshot::default()
        };
        tracing::debug!(path = %path.display(), books = snapshot.books.len(), "opened store");
        Ok(Self::with_snapshot(snapshot, Some(path)))
    }

    fn with_snapshot(snapshot: Snapshot, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                snapshot: RwLock::new(snapshot),
                path,
                read_only: AtomicBool::new(false),
            }),
        }
    }

    /// Makes every subsequent commit fail with [`StoreError::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Returns true if commits are rejected.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::SeqCst)
    }

    /// Commits a changeset and returns its sequence number.
    pub fn commit(&self, changeset: Changeset) -> StoreResult<u64> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }

        let mut guard = self.inner.snapshot.write();
        let mut next = guard.clone();

        for book in changeset.upserts {
            next.books.insert(book.id, book);
        }
        for update in &changeset.updates {
            match next.books.get_mut(&update.book.id) {
                Some(stored) => stored.apply_edits(&update.base, &update.book),
                None => {
                    tracing::debug!(entity = %update.book.id, "dropping edits to a deleted book");
                }
            }
        }
        for id in &changeset.deletes {
            next.books.remove(id);
        }
        for token in changeset.token_upserts {
            next.change_tokens.insert(token.zone_id.clone(), token);
        }
        for zone in &changeset.token_deletes {
            next.change_tokens.remove(zone);
        }
        next.sequence += 1;

        if let Some(path) = &self.inner.path {
            write_snapshot(path, &next)?;
        }

        let sequence = next.sequence;
        *guard = next;
        Ok(sequence)
    }

    /// Returns the stored copy of a book.
    pub fn book(&self, id: EntityId) -> Option<Book> {
        self.inner.snapshot.read().books.get(&id).cloned()
    }

    /// Returns every stored book.
    pub fn books(&self) -> Vec<Book> {
        self.inner.snapshot.read().books.values().cloned().collect()
    }

    /// Returns the number of stored books.
    pub fn book_count(&self) -> usize {
        self.inner.snapshot.read().books.len()
    }

    /// Returns the stored change token of a zone.
    pub fn change_token(&self, zone: &ZoneId) -> Option<ChangeToken> {
        self.inner.snapshot.read().change_tokens.get(zone).cloned()
    }

    /// Returns the sequence of the last commit.
    pub fn sequence(&self) -> u64 {
        self.inner.snapshot.read().sequence
    }

    pub(crate) fn load(&self) -> (BTreeMap<EntityId, Book>, BTreeMap<ZoneId, ChangeToken>) {
        let snapshot = self.inner.snapshot.read();
        (snapshot.books.clone(), snapshot.change_tokens.clone())
    }
}

/// Writes the snapshot next to `path` and renames it into place.
fn write_snapshot(path: &Path, snapshot: &Snapshot) -> StoreResult<()> {
    let data = to_cbor(snapshot)?;
    let temp_path = path.with_extension(TEMP_SUFFIX);

    let mut file = File::create(&temp_path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    Ok(())
}
