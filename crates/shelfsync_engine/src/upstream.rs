//! Local to remote change processors.
//!
//! Each processor declares a predicate selecting the books it is
//! responsible for, and a push that makes the predicate false for every
//! book it confirms. Processors never track what they have already sent:
//! the predicate is the only source of truth, evaluated against the sync
//! context.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::mapper;
use crate::remote::{PushRequest, RecordSave, RemoteClient};
use crate::signals::SyncSignals;
use shelfsync_model::{
    ErrorStrategy, RecordId, RemoteError, RemoteErrorCode, RemoteRecord, ZoneId,
};
use shelfsync_store::{Book, Context, ContextState, EntityId, Predicate, RecordKey, StoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const TARGET: &str = "shelfsync::upstream";

/// What happened to the books handed to a processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Name of the processor.
    pub processor: &'static str,
    /// Every book handed to the processor.
    pub submitted: Vec<EntityId>,
    /// Books the remote confirmed.
    pub succeeded: Vec<EntityId>,
    /// Books that could not be pushed.
    pub failed: Vec<EntityId>,
}

impl ProcessReport {
    fn new(processor: &'static str, submitted: Vec<EntityId>) -> Self {
        Self {
            processor,
            submitted,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Called exactly once when a processor has finished with its books.
pub type ProcessCompletion = Box<dyn FnOnce(ProcessReport) + Send>;

/// Pushes one kind of local change to the remote.
pub trait UpstreamChangeProcessor: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Predicate selecting the books this processor is responsible for.
    fn pending_predicate(&self) -> Predicate;

    /// Pushes `entities` in the background and reports through
    /// `completion`, whatever the outcome.
    fn process_local_changes(&self, entities: Vec<EntityId>, completion: ProcessCompletion);
}

struct Shared<R> {
    config: SyncConfig,
    remote: Arc<R>,
    context: Context,
    signals: SyncSignals,
}

impl<R: RemoteClient> Shared<R> {
    fn zone(&self) -> &ZoneId {
        &self.config.zone
    }

    /// Loads the books among `entities` that still match `predicate`.
    async fn candidates(&self, entities: Vec<EntityId>, predicate: Predicate) -> StoreResult<Vec<Book>> {
        self.context
            .perform(move |state| {
                entities
                    .iter()
                    .filter_map(|id| state.get(*id))
                    .filter(|book| predicate.evaluate(book))
                    .cloned()
                    .collect()
            })
            .await
    }

    /// Runs `change` on the sync context and saves, rolling back on failure.
    ///
    /// A failed save is fatal.
    async fn commit<F>(&self, change: F) -> SyncResult<()>
    where
        F: FnOnce(&mut ContextState) + Send + 'static,
    {
        let saved = self
            .context
            .perform(move |state| {
                change(state);
                let saved = state.save();
                if saved.is_err() {
                    state.rollback();
                }
                saved.map(|_| ())
            })
            .await;
        match saved {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) | Err(e) => Err(self.fatal(format!("failed to save push results: {e}"))),
        }
    }

    fn fatal(&self, reason: String) -> SyncError {
        error!(target: TARGET, reason = %reason, "fatal sync error");
        self.signals.disable_sync(reason.clone());
        SyncError::fatal(reason)
    }

    /// Reacts to a push that failed as a whole.
    fn push_failed(&self, error: RemoteError) -> SyncError {
        match error.strategy() {
            Some(ErrorStrategy::RetryLater) => {
                warn!(
                    target: TARGET,
                    error = %error,
                    retry_after_secs = error.retry_after().map(|d| d.as_secs()),
                    "pausing sync"
                );
                self.signals.pause_sync(error.retry_after());
            }
            Some(ErrorStrategy::DisableSync) | Some(ErrorStrategy::DisableSyncUnexpectedError) => {
                error!(target: TARGET, error = %error, "disabling sync");
                self.signals.disable_sync(error.to_string());
            }
            Some(ErrorStrategy::ResetChangeToken) => {
                error!(target: TARGET, error = %error, "cursor error while pushing; disabling sync");
                self.signals.disable_sync(error.to_string());
            }
            Some(strategy) => {
                return self.fatal(format!("unsupported remote error strategy {strategy:?}: {error}"));
            }
            None => {
                error!(target: TARGET, error = %error, "unrecognized error while pushing");
            }
        }
        SyncError::Remote(error)
    }

    /// Reacts to a per-item error. Returns the error to halt the processor.
    fn item_failed(&self, record: &RecordId, error: RemoteError) -> SyncError {
        if error.strategy() == Some(ErrorStrategy::RetryLater) {
            warn!(target: TARGET, record = %record, error = %error, "pausing sync");
            self.signals.pause_sync(error.retry_after());
            return SyncError::Remote(error);
        }
        self.fatal(format!("unsupported error for record {record}: {error}"))
    }
}

/// Outcome of one pushed chunk.
#[derive(Default)]
struct ChunkOutcome {
    succeeded: Vec<EntityId>,
    failed: Vec<EntityId>,
    halt: bool,
}

async fn run_chunks<R, F, Fut>(
    shared: &Shared<R>,
    mut report: ProcessReport,
    books: Vec<Book>,
    push_chunk: F,
) -> ProcessReport
where
    R: RemoteClient,
    F: Fn(Vec<Book>) -> Fut,
    Fut: std::future::Future<Output = ChunkOutcome>,
{
    let mut halted = false;
    for chunk in books.chunks(shared.config.push_batch_size.max(1)) {
        if halted {
            report.failed.extend(chunk.iter().map(|b| b.id));
            continue;
        }
        let outcome = push_chunk(chunk.to_vec()).await;
        report.succeeded.extend(outcome.succeeded);
        report.failed.extend(outcome.failed);
        halted = outcome.halt;
    }
    report
}

/// Name of the uploader.
pub const BOOK_UPLOADER: &str = "BookUploader";
/// Name of the deleter.
pub const BOOK_DELETER: &str = "BookDeleter";

/// Pushes new and edited books.
///
/// A book the remote has never confirmed is sent with every field; a known
/// book is sent with its pending keys only, together with its system
/// fields. On success the remote identifier and system fields are stamped
/// and the pushed keys are cleared, unless they were edited again while the
/// push was in flight.
pub struct BookUploader<R: RemoteClient> {
    shared: Arc<Shared<R>>,
}

impl<R: RemoteClient> BookUploader<R> {
    /// Creates an uploader pushing books from `context`.
    pub fn new(config: SyncConfig, remote: Arc<R>, context: Context, signals: SyncSignals) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                remote,
                context,
                signals,
            }),
        }
    }

    /// Books never confirmed by the remote, or with unconfirmed edits.
    pub fn predicate() -> Predicate {
        Predicate::RemoteIdentifierIsNull
            .or(Predicate::HasPendingRemoteKeys)
            .and(Predicate::PendingRemoteDeletion.not())
    }

    /// Pushes the books among `entities` that still need uploading.
    pub async fn upload(&self, entities: Vec<EntityId>) -> ProcessReport {
        upload(&self.shared, entities).await
    }
}

impl<R: RemoteClient> UpstreamChangeProcessor for BookUploader<R> {
    fn name(&self) -> &'static str {
        BOOK_UPLOADER
    }

    fn pending_predicate(&self) -> Predicate {
        Self::predicate()
    }

    fn process_local_changes(&self, entities: Vec<EntityId>, completion: ProcessCompletion) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let report = upload(&shared, entities).await;
            completion(report);
        });
    }
}

async fn upload<R: RemoteClient>(shared: &Shared<R>, entities: Vec<EntityId>) -> ProcessReport {
    let mut report = ProcessReport::new(BOOK_UPLOADER, entities.clone());
    let books = match shared.candidates(entities, BookUploader::<R>::predicate()).await {
        Ok(books) => books,
        Err(e) => {
            error!(target: TARGET, error = %e, "failed to load books to upload");
            report.failed = report.submitted.clone();
            return report;
        }
    };
    run_chunks(shared, report, books, |chunk| upload_chunk(shared, chunk)).await
}

struct SentRecord {
    entity: EntityId,
    record: RemoteRecord,
    keys: Vec<RecordKey>,
}

async fn upload_chunk<R: RemoteClient>(shared: &Shared<R>, books: Vec<Book>) -> ChunkOutcome {
    let mut outcome = ChunkOutcome::default();
    let mut request = PushRequest::new(shared.zone().clone());
    let mut sent: HashMap<String, SentRecord> = HashMap::new();

    for book in &books {
        let keys: Vec<RecordKey> =
            if book.remote_identifier.is_none() || book.encoded_system_fields.is_none() {
                RecordKey::ALL.to_vec()
            } else {
                book.pending_remote_keys.iter().copied().collect()
            };
        let Some(record) = mapper::to_record(book, shared.zone(), &keys) else {
            error!(target: TARGET, entity = %book.id, "book has no identity to derive a record name from");
            outcome.failed.push(book.id);
            continue;
        };
        request.saves.push(RecordSave {
            record: record.clone(),
            keys: keys.iter().map(|k| k.as_str().to_owned()).collect(),
        });
        sent.insert(
            record.name().to_owned(),
            SentRecord {
                entity: book.id,
                record,
                keys,
            },
        );
    }
    if request.is_empty() {
        return outcome;
    }

    debug!(target: TARGET, records = request.saves.len(), "pushing records");
    let response = match shared.remote.push(request).await {
        Ok(response) => response,
        Err(e) => {
            shared.push_failed(e);
            outcome.failed.extend(sent.values().map(|s| s.entity));
            outcome.halt = true;
            return outcome;
        }
    };

    let mut confirmed = Vec::new();
    for (id, result) in response.saved {
        let Some(sent_record) = sent.remove(&id.name) else {
            warn!(target: TARGET, record = %id, "remote confirmed a record that was not sent");
            continue;
        };
        match result {
            Ok(stored) => confirmed.push((sent_record, stored)),
            Err(e) => {
                shared.item_failed(&id, e);
                outcome.failed.push(sent_record.entity);
                outcome.halt = true;
            }
        }
    }
    outcome.failed.extend(sent.values().map(|s| s.entity));

    let entities: Vec<EntityId> = confirmed.iter().map(|(s, _)| s.entity).collect();
    let committed = shared
        .commit(move |state| {
            for (sent_record, stored) in &confirmed {
                state.refresh(sent_record.entity);
                let updated = state.modify(sent_record.entity, |book| {
                    book.remote_identifier = Some(stored.name().to_owned());
                    book.encoded_system_fields = stored.system_fields.clone();
                    for key in &sent_record.keys {
                        let current = mapper::field_value(book, *key);
                        if current.as_ref() == sent_record.record.get(key.as_str()) {
                            book.pending_remote_keys.remove(key);
                        }
                    }
                });
                if updated.is_none() {
                    debug!(target: TARGET, entity = %sent_record.entity, "uploaded book was deleted locally");
                }
            }
        })
        .await;

    match committed {
        Ok(()) => {
            info!(target: TARGET, records = entities.len(), "uploaded records");
            outcome.succeeded.extend(entities);
        }
        Err(_) => {
            outcome.failed.extend(entities);
            outcome.halt = true;
        }
    }
    outcome
}

/// Deletes remotely the books flagged for remote deletion.
///
/// On confirmation, or when the remote no longer has the record, the local
/// book is deleted. Any other per-item error is a remote contract violation
/// and disables sync.
pub struct BookDeleter<R: RemoteClient> {
    shared: Arc<Shared<R>>,
}

impl<R: RemoteClient> BookDeleter<R> {
    /// Creates a deleter for books in `context`.
    pub fn new(config: SyncConfig, remote: Arc<R>, context: Context, signals: SyncSignals) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                remote,
                context,
                signals,
            }),
        }
    }

    /// Books flagged for remote deletion that the remote knows about.
    pub fn predicate() -> Predicate {
        Predicate::PendingRemoteDeletion.and(Predicate::RemoteIdentifierIsNull.not())
    }

    /// Deletes the books among `entities` that still need deleting.
    pub async fn delete(&self, entities: Vec<EntityId>) -> ProcessReport {
        delete(&self.shared, entities).await
    }
}

impl<R: RemoteClient> UpstreamChangeProcessor for BookDeleter<R> {
    fn name(&self) -> &'static str {
        BOOK_DELETER
    }

    fn pending_predicate(&self) -> Predicate {
        Self::predicate()
    }

    fn process_local_changes(&self, entities: Vec<EntityId>, completion: ProcessCompletion) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let report = delete(&shared, entities).await;
            completion(report);
        });
    }
}

async fn delete<R: RemoteClient>(shared: &Shared<R>, entities: Vec<EntityId>) -> ProcessReport {
    let mut report = ProcessReport::new(BOOK_DELETER, entities.clone());
    let books = match shared.candidates(entities, BookDeleter::<R>::predicate()).await {
        Ok(books) => books,
        Err(e) => {
            error!(target: TARGET, error = %e, "failed to load books to delete");
            report.failed = report.submitted.clone();
            return report;
        }
    };
    run_chunks(shared, report, books, |chunk| delete_chunk(shared, chunk)).await
}

async fn delete_chunk<R: RemoteClient>(shared: &Shared<R>, books: Vec<Book>) -> ChunkOutcome {
    let mut outcome = ChunkOutcome::default();
    let mut request = PushRequest::new(shared.zone().clone());
    let mut sent: HashMap<String, EntityId> = HashMap::new();

    for book in &books {
        if let Some(name) = &book.remote_identifier {
            request
                .deletes
                .push(RecordId::new(shared.zone().clone(), name.clone()));
            sent.insert(name.clone(), book.id);
        }
    }
    if request.is_empty() {
        return outcome;
    }

    debug!(target: TARGET, records = request.deletes.len(), "deleting records");
    let response = match shared.remote.push(request).await {
        Ok(response) => response,
        Err(e) => {
            shared.push_failed(e);
            outcome.failed.extend(sent.values().copied());
            outcome.halt = true;
            return outcome;
        }
    };

    let mut confirmed = Vec::new();
    for (id, result) in response.deleted {
        let Some(entity) = sent.remove(&id.name) else {
            warn!(target: TARGET, record = %id, "remote confirmed a deletion that was not sent");
            continue;
        };
        match result {
            Ok(()) => confirmed.push(entity),
            Err(e) if e.code() == Some(RemoteErrorCode::UnknownItem) => {
                debug!(target: TARGET, record = %id, "record already deleted remotely");
                confirmed.push(entity);
            }
            Err(e) => {
                shared.fatal(format!("unexpected error deleting record {id}: {e}"));
                outcome.failed.push(entity);
                outcome.halt = true;
            }
        }
    }
    outcome.failed.extend(sent.values().copied());

    let entities = confirmed.clone();
    match shared
        .commit(move |state| {
            for entity in &confirmed {
                state.refresh(*entity);
                state.delete(*entity);
            }
        })
        .await
    {
        Ok(()) => {
            info!(target: TARGET, records = entities.len(), "deleted records");
            outcome.succeeded.extend(entities);
        }
        Err(_) => {
            outcome.failed.extend(entities);
            outcome.halt = true;
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_remote::MemoryRemote;
    use shelfsync_testkit::BookBuilder;

    #[test]
    fn uploader_predicate() {
        let predicate = BookUploader::<MemoryRemote>::predicate();

        assert!(predicate.evaluate(&BookBuilder::manual("New").build()));
        assert!(!predicate.evaluate(&BookBuilder::manual("Synced").synced("mid:1").build()));
        assert!(predicate.evaluate(
            &BookBuilder::manual("Edited")
                .synced("mid:1")
                .pending(RecordKey::Notes)
                .build()
        ));
        assert!(!predicate.evaluate(
            &BookBuilder::manual("Gone")
                .synced("mid:1")
                .pending(RecordKey::Notes)
                .pending_deletion()
                .build()
        ));
    }

    #[test]
    fn deleter_predicate() {
        let predicate = BookDeleter::<MemoryRemote>::predicate();

        assert!(predicate.evaluate(
            &BookBuilder::manual("Gone")
                .synced("mid:1")
                .pending_deletion()
                .build()
        ));
        assert!(!predicate.evaluate(&BookBuilder::manual("Local").pending_deletion().build()));
        assert!(!predicate.evaluate(&BookBuilder::manual("Synced").synced("mid:1").build()));
    }

    #[test]
    fn processors_partition_pending_books() {
        let uploader = BookUploader::<MemoryRemote>::predicate();
        let deleter = BookDeleter::<MemoryRemote>::predicate();
        let flagged = BookBuilder::manual("Gone")
            .synced("mid:1")
            .pending(RecordKey::Title)
            .pending_deletion()
            .build();

        assert!(!uploader.evaluate(&flagged));
        assert!(deleter.evaluate(&flagged));
    }
}
