//! Working copies bound to their own serial queue.
//!
//! A [`Context`] owns a [`ContextState`]: an in-memory copy of the store plus
//! the unsaved inserts, updates and deletes made to it. The state lives on a
//! dedicated thread and is only reachable through jobs submitted with
//! [`Context::perform`], so every read and write against one copy is
//! serialized without a lock. Copies talk to each other only through
//! [`SaveNotification`]s merged onto the destination's own queue.

use crate::book::Book;
use crate::change_token::ChangeToken;
use crate::error::{StoreError, StoreResult};
use crate::id::EntityId;
use crate::notification::{SaveFeed, SaveNotification};
use crate::predicate::{FetchRequest, Predicate};
use crate::store::{BookUpdate, Changeset, PersistentStore};
use shelfsync_model::{Cursor, ZoneId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce(&mut ContextState) + Send>;

/// A named working copy of the store.
///
/// Cloning is cheap; clones submit to the same queue. The queue shuts down
/// once every clone has been dropped.
#[derive(Clone)]
pub struct Context {
    name: Arc<str>,
    jobs: UnboundedSender<Job>,
    feed: Arc<SaveFeed>,
}

impl Context {
    /// Creates a working copy loaded from `store` and starts its queue.
    pub fn new(name: impl Into<String>, store: PersistentStore) -> StoreResult<Self> {
        let name: String = name.into();
        let feed = Arc::new(SaveFeed::new());
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let mut state = ContextState::new(name.clone(), store, Arc::clone(&feed));

        let thread_name = name.clone();
        thread::Builder::new()
            .name(format!("shelfsync-{name}"))
            .spawn(move || {
                while let Some(job) = queue.blocking_recv() {
                    job(&mut state);
                }
                tracing::debug!(context = %thread_name, "context queue closed");
            })?;

        Ok(Self {
            name: name.into(),
            jobs,
            feed,
        })
    }

    /// Returns the context's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `job` on the context's queue and waits for its result.
    pub async fn perform<R, F>(&self, job: F) -> StoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ContextState) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move |state| {
            let _ = tx.send(job(state));
        }))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Subscribes to the notifications of this context's saves.
    pub fn subscribe(&self) -> UnboundedReceiver<SaveNotification> {
        self.feed.subscribe()
    }

    /// Merges another context's save into this copy.
    ///
    /// The merge runs on this context's queue and is not re-published.
    pub async fn merge_changes(&self, notification: SaveNotification) -> StoreResult<()> {
        self.perform(move |state| state.merge(&notification)).await
    }

    /// Reloads every book without unsaved changes from the store.
    pub async fn refresh_all(&self) -> StoreResult<()> {
        self.perform(ContextState::refresh_all).await
    }

    fn submit(&self, job: Job) -> StoreResult<()> {
        self.jobs.send(job).map_err(|_| self.closed())
    }

    fn closed(&self) -> StoreError {
        StoreError::ContextClosed(self.name.to_string())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("name", &self.name).finish()
    }
}

/// The state of one working copy. Only reachable from its context's queue.
pub struct ContextState {
    name: String,
    store: PersistentStore,
    feed: Arc<SaveFeed>,
    books: BTreeMap<EntityId, Book>,
    tokens: BTreeMap<ZoneId, ChangeToken>,
    /// Stored copy each updated book was edited from.
    originals: BTreeMap<EntityId, Book>,
    inserted: BTreeSet<EntityId>,
    updated: BTreeSet<EntityId>,
    deleted: BTreeSet<EntityId>,
    tokens_changed: BTreeSet<ZoneId>,
    tokens_deleted: BTreeSet<ZoneId>,
}

impl ContextState {
    fn new(name: String, store: PersistentStore, feed: Arc<SaveFeed>) -> Self {
        let (books, tokens) = store.load();
        Self {
            name,
            store,
            feed,
            books,
            tokens,
            originals: BTreeMap::new(),
            inserted: BTreeSet::new(),
            updated: BTreeSet::new(),
            deleted: BTreeSet::new(),
            tokens_changed: BTreeSet::new(),
            tokens_deleted: BTreeSet::new(),
        }
    }

    /// Returns the context's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a book by local identity.
    pub fn get(&self, id: EntityId) -> Option<&Book> {
        self.books.get(&id)
    }

    /// Returns copies of the books matching `request`.
    pub fn fetch(&self, request: &FetchRequest) -> Vec<Book> {
        let matching = self
            .books
            .values()
            .filter(|book| request.predicate.evaluate(book))
            .cloned();
        match request.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Returns the IDs of the books matching `predicate`.
    pub fn fetch_ids(&self, predicate: &Predicate) -> Vec<EntityId> {
        self.books
            .values()
            .filter(|book| predicate.evaluate(book))
            .map(|book| book.id)
            .collect()
    }

    /// Counts the books matching `predicate`.
    pub fn count(&self, predicate: &Predicate) -> usize {
        self.books
            .values()
            .filter(|book| predicate.evaluate(book))
            .count()
    }

    /// Inserts a book, replacing any book with the same identity.
    pub fn insert(&mut self, book: Book) {
        let id = book.id;
        let previous = self.books.insert(id, book);
        let was_deleted = self.deleted.remove(&id);
        if self.inserted.contains(&id) {
            return;
        }
        if previous.is_none() && !was_deleted {
            self.inserted.insert(id);
            return;
        }
        if self.updated.insert(id) {
            match previous.or_else(|| self.store.book(id)) {
                Some(base) => {
                    self.originals.insert(id, base);
                }
                None => {
                    self.updated.remove(&id);
                    self.inserted.insert(id);
                }
            }
        }
    }

    /// Applies `change` to a book. Returns `None` if the book does not exist.
    pub fn modify<R>(&mut self, id: EntityId, change: impl FnOnce(&mut Book) -> R) -> Option<R> {
        let book = self.books.get_mut(&id)?;
        if !self.inserted.contains(&id) && self.updated.insert(id) {
            self.originals.insert(id, book.clone());
        }
        Some(change(book))
    }

    /// Deletes a book. Returns false if it did not exist.
    pub fn delete(&mut self, id: EntityId) -> bool {
        if self.books.remove(&id).is_none() {
            return false;
        }
        self.updated.remove(&id);
        self.originals.remove(&id);
        // Inserted and deleted before any save: nothing to commit.
        if !self.inserted.remove(&id) {
            self.deleted.insert(id);
        }
        true
    }

    /// Deletes a book that the remote has never seen, or flags a book the
    /// remote knows about for remote deletion.
    pub fn delete_or_mark_for_remote_deletion(&mut self, id: EntityId) -> bool {
        let Some(book) = self.books.get(&id) else {
            return false;
        };
        if book.remote_identifier.is_none() {
            self.delete(id)
        } else {
            self.modify(id, |book| book.pending_remote_deletion = true)
                .is_some()
        }
    }

    /// Deletes every book.
    pub fn delete_all_books(&mut self) -> usize {
        let ids: Vec<EntityId> = self.books.keys().copied().collect();
        for id in &ids {
            self.delete(*id);
        }
        ids.len()
    }

    /// Returns the change token of a zone.
    pub fn change_token(&self, zone: &ZoneId) -> Option<&ChangeToken> {
        self.tokens.get(zone)
    }

    /// Creates the change token of a zone, replacing any existing one.
    pub fn create_change_token(&mut self, zone: ZoneId, cursor: Cursor) -> &ChangeToken {
        self.tokens_deleted.remove(&zone);
        self.tokens_changed.insert(zone.clone());
        self.tokens
            .entry(zone.clone())
            .and_modify(|token| token.cursor = cursor.clone())
            .or_insert_with(|| ChangeToken::new(zone, cursor))
    }

    /// Updates the cursor of a zone's change token, creating the token first
    /// if the zone has none.
    pub fn upsert_change_token(&mut self, zone: ZoneId, cursor: Cursor) -> &ChangeToken {
        if !self.tokens.contains_key(&zone) {
            tracing::info!(zone = %zone, "creating change token");
        }
        self.create_change_token(zone, cursor)
    }

    /// Deletes the change token of a zone. Returns false if there was none.
    pub fn delete_change_token(&mut self, zone: &ZoneId) -> bool {
        if self.tokens.remove(zone).is_none() {
            return false;
        }
        self.tokens_changed.remove(zone);
        self.tokens_deleted.insert(zone.clone());
        true
    }

    /// Returns true if the copy has unsaved changes.
    pub fn has_changes(&self) -> bool {
        !(self.inserted.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.tokens_changed.is_empty()
            && self.tokens_deleted.is_empty())
    }

    /// Commits every unsaved change to the store in one commit.
    ///
    /// Updated books are written field by field: only the fields edited in
    /// this copy reach the store. Emits a notification if any book changed.
    /// On failure the unsaved changes are kept.
    pub fn save(&mut self) -> StoreResult<Option<SaveNotification>> {
        if !self.has_changes() {
            return Ok(None);
        }

        let inserted_ids: Vec<EntityId> = self.inserted.iter().copied().collect();
        let updated_ids: Vec<EntityId> = self.updated.iter().copied().collect();
        let deleted: Vec<EntityId> = self.deleted.iter().copied().collect();

        let mut upserts = self.collect_books(&inserted_ids);
        let mut updates = Vec::new();
        for id in &updated_ids {
            let Some(book) = self.books.get(id) else {
                continue;
            };
            match self.originals.get(id) {
                Some(base) => updates.push(BookUpdate {
                    base: base.clone(),
                    book: book.clone(),
                }),
                None => upserts.push(book.clone()),
            }
        }

        let changeset = Changeset {
            upserts,
            updates,
            deletes: deleted.clone(),
            token_upserts: self
                .tokens_changed
                .iter()
                .filter_map(|zone| self.tokens.get(zone).cloned())
                .collect(),
            token_deletes: self.tokens_deleted.iter().cloned().collect(),
        };

        let sequence = self.store.commit(changeset)?;
        self.clear_pending();
        // Pick up fields other copies committed since these books were loaded.
        for id in inserted_ids.iter().chain(updated_ids.iter()) {
            self.refresh(*id);
        }
        let inserted = self.collect_books(&inserted_ids);
        let updated = self.collect_books(&updated_ids);

        let notification = SaveNotification {
            context: self.name.clone(),
            sequence,
            inserted,
            updated,
            deleted,
        };
        if notification.is_empty() {
            return Ok(None);
        }

        tracing::trace!(
            context = %self.name,
            sequence,
            inserted = notification.inserted.len(),
            updated = notification.updated.len(),
            deleted = notification.deleted.len(),
            "saved"
        );
        self.feed.emit(&notification);
        Ok(Some(notification))
    }

    /// Applies another context's save.
    ///
    /// Books are reloaded from the store rather than copied from the
    /// notification, so a merge arriving after a later save never rolls a
    /// book back. Unsaved edits to a merged book are replayed onto its
    /// stored copy; unsaved inserts and deletes are left alone.
    pub fn merge(&mut self, notification: &SaveNotification) {
        let ids = notification
            .changed_ids()
            .into_iter()
            .chain(notification.deleted.iter().copied());
        for id in ids {
            if self.updated.contains(&id) {
                self.rebase(id);
            } else {
                self.refresh(id);
            }
        }
        self.reload_tokens();
    }

    /// Reloads every book from the store, replaying unsaved edits.
    pub fn refresh_all(&mut self) {
        let (mut stored, _) = self.store.load();
        for id in self.inserted.iter().chain(self.updated.iter()) {
            if let Some(book) = self.books.remove(id) {
                stored.insert(*id, book);
            }
        }
        for id in &self.deleted {
            stored.remove(id);
        }
        self.books = stored;
        let updated: Vec<EntityId> = self.updated.iter().copied().collect();
        for id in updated {
            self.rebase(id);
        }
        self.reload_tokens();
    }

    /// Reloads one book from the store unless it has unsaved changes.
    pub fn refresh(&mut self, id: EntityId) {
        if self.inserted.contains(&id) || self.updated.contains(&id) || self.deleted.contains(&id) {
            return;
        }
        match self.store.book(id) {
            Some(book) => {
                self.books.insert(id, book);
            }
            None => {
                self.books.remove(&id);
            }
        }
    }

    /// Replays the unsaved edits of an updated book onto its stored copy.
    ///
    /// A book deleted in the store since it was loaded stays deleted.
    fn rebase(&mut self, id: EntityId) {
        let Some(base) = self.originals.remove(&id) else {
            return;
        };
        match self.store.book(id) {
            Some(stored) => {
                let mut rebased = stored.clone();
                if let Some(edited) = self.books.get(&id) {
                    rebased.apply_edits(&base, edited);
                }
                self.books.insert(id, rebased);
                self.originals.insert(id, stored);
            }
            None => {
                tracing::debug!(context = %self.name, entity = %id, "book deleted elsewhere; dropping unsaved edits");
                self.books.remove(&id);
                self.updated.remove(&id);
            }
        }
    }

    /// Discards every unsaved change and reloads from the store.
    pub fn rollback(&mut self) {
        self.clear_pending();
        let (books, tokens) = self.store.load();
        self.books = books;
        self.tokens = tokens;
    }

    fn reload_tokens(&mut self) {
        let (_, mut stored) = self.store.load();
        for zone in &self.tokens_changed {
            if let Some(token) = self.tokens.get(zone) {
                stored.insert(zone.clone(), token.clone());
            }
        }
        for zone in &self.tokens_deleted {
            stored.remove(zone);
        }
        self.tokens = stored;
    }

    fn collect_books(&self, ids: &[EntityId]) -> Vec<Book> {
        ids.iter().filter_map(|id| self.books.get(id).cloned()).collect()
    }

    fn clear_pending(&mut self) {
        self.originals.clear();
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
        self.tokens_changed.clear();
        self.tokens_deleted.clear();
    }
}
