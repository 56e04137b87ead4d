//! Remote to local change application.

use crate::config::SyncConfig;
use crate::coordinator::CoordinatorState;
use crate::error::{SyncError, SyncResult};
use crate::mapper;
use crate::remote::{RemoteChange, RemoteClient};
use crate::signals::SyncSignals;
use parking_lot::RwLock;
use shelfsync_model::{Cursor, ErrorStrategy, RecordId, RemoteError, RemoteRecord};
use shelfsync_store::{
    Book, Context, ContextState, EntityId, FetchRequest, Predicate, StoreResult,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

const TARGET: &str = "shelfsync::downstream";

/// The state of the downstream processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamState {
    /// No fetch has run yet.
    Idle,
    /// Waiting for remote changes.
    Fetching,
    /// Writing remote changes to the sync context.
    Applying,
    /// The last fetch completed.
    Done,
    /// The last fetch failed.
    Failed,
}

/// Tri-state outcome of a fetch cycle, for hosts reporting to a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchResult {
    /// Remote changes were applied.
    NewData,
    /// The remote had nothing new.
    NoData,
    /// The fetch failed.
    Failed,
}

impl From<&SyncResult<FetchResult>> for FetchResult {
    fn from(result: &SyncResult<FetchResult>) -> Self {
        match result {
            Ok(outcome) => *outcome,
            Err(_) => FetchResult::Failed,
        }
    }
}

/// Applies remote changes to the sync context.
///
/// One cycle:
/// - Reads the zone's change token and fetches everything after it
/// - Buffers changes until the remote reports a cursor covering them
/// - Applies each buffered batch and its cursor in a single save
///
/// The cursor is never persisted ahead of the changes it describes, so a
/// cycle interrupted at any point resumes without losing data.
pub struct DownstreamProcessor<R: RemoteClient> {
    config: SyncConfig,
    remote: Arc<R>,
    context: Context,
    signals: SyncSignals,
    coordinator: watch::Receiver<CoordinatorState>,
    state: RwLock<DownstreamState>,
    cycle: Mutex<()>,
}

impl<R: RemoteClient> DownstreamProcessor<R> {
    /// Creates a processor writing into `context`.
    ///
    /// Changes are only applied while `coordinator` reports a running
    /// coordinator.
    pub fn new(
        config: SyncConfig,
        remote: Arc<R>,
        context: Context,
        signals: SyncSignals,
        coordinator: watch::Receiver<CoordinatorState>,
    ) -> Self {
        Self {
            config,
            remote,
            context,
            signals,
            coordinator,
            state: RwLock::new(DownstreamState::Idle),
            cycle: Mutex::new(()),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> DownstreamState {
        *self.state.read()
    }

    fn set_state(&self, state: DownstreamState) {
        *self.state.write() = state;
    }

    fn is_running(&self) -> bool {
        matches!(
            *self.coordinator.borrow(),
            CoordinatorState::Starting | CoordinatorState::Started
        )
    }

    /// Runs one fetch cycle.
    ///
    /// Remote errors have already been acted on (token reset or a signal
    /// raised) by the time they are returned.
    pub async fn process_remote_changes(&self) -> SyncResult<FetchResult> {
        let _cycle = self.cycle.lock().await;
        let result = self.run_cycle().await;
        self.set_state(match result {
            Ok(_) => DownstreamState::Done,
            Err(_) => DownstreamState::Failed,
        });
        result
    }

    async fn run_cycle(&self) -> SyncResult<FetchResult> {
        self.set_state(DownstreamState::Fetching);
        let zone = self.config.zone.clone();
        let since = self
            .context
            .perform(move |state| state.change_token(&zone).map(|t| t.cursor.clone()))
            .await?;

        debug!(
            target: TARGET,
            zone = %self.config.zone,
            resuming = since.is_some(),
            "fetching remote changes"
        );

        let (events, mut changes) = mpsc::unbounded_channel();
        let fetch = self.remote.fetch_changes(&self.config.zone, since, events);
        let consume = async {
            let mut batch = Vec::new();
            while let Some(change) = changes.recv().await {
                match change {
                    RemoteChange::CursorUpdated(cursor) => {
                        let applied = std::mem::take(&mut batch);
                        self.apply_batch(applied, Some(cursor)).await?;
                    }
                    change => batch.push(change),
                }
            }
            Ok::<_, SyncError>(batch)
        };
        let (fetched, consumed) = tokio::join!(fetch, consume);

        let batch = match consumed {
            Ok(batch) => batch,
            Err(SyncError::Store(e)) => return Err(self.fatal(format!("failed to save remote changes: {e}"))),
            Err(e) => return Err(e),
        };

        match fetched {
            Ok(completion) if completion.has_changes => {
                let count = batch.len();
                self.apply_batch(batch, completion.new_cursor)
                    .await
                    .map_err(|e| match e {
                        SyncError::Store(e) => {
                            self.fatal(format!("failed to save remote changes: {e}"))
                        }
                        e => e,
                    })?;
                info!(target: TARGET, zone = %self.config.zone, changes = count, "applied remote changes");
                Ok(FetchResult::NewData)
            }
            Ok(_) => {
                debug!(target: TARGET, zone = %self.config.zone, "no remote changes");
                Ok(FetchResult::NoData)
            }
            Err(e) => {
                if !batch.is_empty() {
                    debug!(target: TARGET, discarded = batch.len(), "discarding changes without a cursor");
                }
                Err(self.handle_remote_error(e).await)
            }
        }
    }

    async fn apply_batch(&self, batch: Vec<RemoteChange>, cursor: Option<Cursor>) -> SyncResult<()> {
        if !self.is_running() {
            debug!(target: TARGET, "coordinator stopped; ignoring remote changes");
            return Err(SyncError::Cancelled);
        }
        self.set_state(DownstreamState::Applying);

        let zone = self.config.zone.clone();
        self.context
            .perform(move |state| -> StoreResult<()> {
                for change in &batch {
                    match change {
                        RemoteChange::Deleted(id) => apply_deletion(state, id),
                        RemoteChange::Changed(record) => apply_change(state, record),
                        RemoteChange::CursorUpdated(_) => {}
                    }
                }
                if let Some(cursor) = cursor {
                    state.upsert_change_token(zone, cursor);
                }
                if let Err(e) = state.save() {
                    state.rollback();
                    return Err(e);
                }
                Ok(())
            })
            .await??;
        Ok(())
    }

    async fn handle_remote_error(&self, error: RemoteError) -> SyncError {
        match error.strategy() {
            Some(ErrorStrategy::ResetChangeToken) => {
                warn!(target: TARGET, zone = %self.config.zone, "change token expired; deleting it");
                let zone = self.config.zone.clone();
                let reset = self
                    .context
                    .perform(move |state| {
                        state.delete_change_token(&zone);
                        let saved = state.save();
                        if saved.is_err() {
                            state.rollback();
                        }
                        saved.map(|_| ())
                    })
                    .await;
                match reset {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return self.fatal(format!("failed to delete change token: {e}")),
                    Err(e) => return self.fatal(format!("failed to delete change token: {e}")),
                }
            }
            Some(ErrorStrategy::DisableSync) | Some(ErrorStrategy::DisableSyncUnexpectedError) => {
                error!(target: TARGET, error = %error, "disabling sync");
                self.signals.disable_sync(error.to_string());
            }
            Some(ErrorStrategy::RetryLater) => {
                warn!(
                    target: TARGET,
                    error = %error,
                    retry_after_secs = error.retry_after().map(|d| d.as_secs()),
                    "pausing sync"
                );
                self.signals.pause_sync(error.retry_after());
            }
            Some(strategy) => {
                return self.fatal(format!("unsupported remote error strategy {strategy:?}: {error}"));
            }
            None => {
                error!(target: TARGET, error = %error, "unrecognized error while fetching");
            }
        }
        SyncError::Remote(error)
    }

    fn fatal(&self, reason: String) -> SyncError {
        error!(target: TARGET, reason = %reason, "fatal sync error");
        self.signals.disable_sync(reason.clone());
        SyncError::fatal(reason)
    }
}

fn apply_deletion(state: &mut ContextState, id: &RecordId) {
    let matches = state.fetch_ids(&Predicate::RemoteIdentifierEquals(id.name.clone()));
    if matches.is_empty() {
        debug!(target: TARGET, record = %id, "no local book for remote deletion");
    }
    for entity in matches {
        debug!(target: TARGET, record = %id, entity = %entity, "deleting local book");
        state.delete(entity);
    }
}

fn apply_change(state: &mut ContextState, record: &RemoteRecord) {
    if record.record_type != Book::RECORD_TYPE {
        warn!(target: TARGET, record = %record.id, record_type = %record.record_type, "ignoring record of unknown type");
        return;
    }

    if let Some(entity) = local_match(state, record.name()) {
        state.refresh(entity);
        let updated = state.modify(entity, |book| {
            let excluding: BTreeSet<_> = book.pending_remote_keys.clone();
            mapper::apply(record, book, &excluding);
        });
        if updated.is_some() {
            debug!(target: TARGET, record = %record.id, entity = %entity, "updated local book");
            return;
        }
    }

    let mut book = Book::blank();
    mapper::apply(record, &mut book, &BTreeSet::new());
    debug!(target: TARGET, record = %record.id, entity = %book.id, "creating local book");
    state.insert(book);
}

fn local_match(state: &ContextState, record_name: &str) -> Option<EntityId> {
    let direct = FetchRequest::new(Predicate::RemoteIdentifierEquals(record_name.to_owned()))
        .with_limit(1);
    if let Some(book) = state.fetch(&direct).first() {
        return Some(book.id);
    }

    // Two results are enough to tell an ambiguous match.
    let candidates =
        state.fetch(&FetchRequest::new(mapper::candidate_predicate(record_name)?).with_limit(2));
    if candidates.len() > 1 {
        warn!(
            target: TARGET,
            record = record_name,
            "several local books match remote record; using the first"
        );
    }
    candidates.first().map(|book| book.id)
}
