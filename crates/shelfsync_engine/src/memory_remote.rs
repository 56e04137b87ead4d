//! In-memory remote record service.
//!
//! Keeps records per zone together with an append-only change log. Cursors
//! are opaque to callers and encode a position in that log plus an epoch;
//! bumping the epoch invalidates every cursor handed out so far.

use crate::remote::{FetchCompletion, PushRequest, PushResponse, RemoteChange, RemoteClient};
use parking_lot::Mutex;
use shelfsync_model::{
    Cursor, RecordId, RemoteError, RemoteErrorCode, RemoteRecord, RemoteResult, SystemFields,
    ZoneId,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

const CURSOR_LEN: usize = 12;

enum LogEntry {
    Changed(String),
    Deleted(String),
}

impl LogEntry {
    fn name(&self) -> &str {
        match self {
            LogEntry::Changed(name) | LogEntry::Deleted(name) => name,
        }
    }
}

#[derive(Default)]
struct ZoneLog {
    records: BTreeMap<String, RemoteRecord>,
    log: Vec<LogEntry>,
}

struct FetchFailure {
    error: RemoteError,
    after_changes: bool,
}

#[derive(Default)]
struct RemoteState {
    epoch: u32,
    zones: BTreeMap<ZoneId, ZoneLog>,
    cursor_batch: usize,
    next_tag: u64,
    init_error: Option<RemoteError>,
    fetch_failures: VecDeque<FetchFailure>,
    push_errors: VecDeque<RemoteError>,
    item_errors: HashMap<String, RemoteError>,
    lost_confirmations: usize,
    fetch_log: Vec<Option<Cursor>>,
    push_log: Vec<PushRequest>,
}

impl RemoteState {
    fn stamp(&mut self, record: &mut RemoteRecord) {
        self.next_tag += 1;
        let tag = format!("tag-{}", self.next_tag);
        record.system_fields = Some(SystemFields::from_bytes(tag.into_bytes()));
    }

    fn cursor(&self, position: usize) -> Cursor {
        let mut bytes = Vec::with_capacity(CURSOR_LEN);
        bytes.extend_from_slice(&self.epoch.to_be_bytes());
        bytes.extend_from_slice(&(position as u64).to_be_bytes());
        Cursor::from_bytes(bytes)
    }

    fn position(&self, cursor: &Cursor) -> Option<usize> {
        let bytes = cursor.as_bytes();
        if bytes.len() != CURSOR_LEN {
            return None;
        }
        let epoch = u32::from_be_bytes(bytes[..4].try_into().ok()?);
        let position = u64::from_be_bytes(bytes[4..].try_into().ok()?);
        (epoch == self.epoch).then_some(position as usize)
    }
}

struct FetchPlan {
    changes: Vec<RemoteChange>,
    completion: FetchCompletion,
    failure: Option<RemoteError>,
}

/// An in-memory remote for testing and demos.
///
/// Supports scripted failures: initialisation errors, failing fetches and
/// pushes, per-item errors, lost confirmations, expired cursors, held pushes
/// and a disconnected network.
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    connected: AtomicBool,
    initialised: AtomicBool,
    held: watch::Sender<bool>,
    push_attempts: watch::Sender<usize>,
}

impl MemoryRemote {
    /// Creates an empty, uninitialised remote.
    pub fn new() -> Self {
        let (held, _) = watch::channel(false);
        let (push_attempts, _) = watch::channel(0);
        Self {
            state: Mutex::new(RemoteState::default()),
            connected: AtomicBool::new(true),
            initialised: AtomicBool::new(false),
            held,
            push_attempts,
        }
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Checks if the network is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Emits an intermediate cursor after every `batch` changes. Zero
    /// disables intermediate cursors.
    pub fn set_cursor_batch(&self, batch: usize) {
        self.state.lock().cursor_batch = batch;
    }

    /// Invalidates every cursor handed out so far.
    pub fn expire_change_tokens(&self) {
        self.state.lock().epoch += 1;
    }

    /// Makes the next initialisation fail.
    pub fn fail_initialisation(&self, error: RemoteError) {
        self.state.lock().init_error = Some(error);
    }

    /// Makes the next fetch fail before reporting any change.
    pub fn fail_next_fetch(&self, error: RemoteError) {
        self.state.lock().fetch_failures.push_back(FetchFailure {
            error,
            after_changes: false,
        });
    }

    /// Makes the next fetch report its changes and then fail.
    pub fn fail_next_fetch_after_changes(&self, error: RemoteError) {
        self.state.lock().fetch_failures.push_back(FetchFailure {
            error,
            after_changes: true,
        });
    }

    /// Makes the next push fail as a whole.
    pub fn fail_next_push(&self, error: RemoteError) {
        self.state.lock().push_errors.push_back(error);
    }

    /// Makes the next save or delete of the named record fail.
    pub fn fail_item(&self, name: &str, error: RemoteError) {
        self.state.lock().item_errors.insert(name.to_owned(), error);
    }

    /// Applies the next push but reports it as a network failure.
    pub fn lose_next_confirmation(&self) {
        self.state.lock().lost_confirmations += 1;
    }

    /// Makes pushes wait until [`release_pushes`](Self::release_pushes).
    pub fn hold_pushes(&self) {
        self.held.send_replace(true);
    }

    /// Lets held pushes proceed.
    pub fn release_pushes(&self) {
        self.held.send_replace(false);
    }

    /// Creates or replaces a record as if another device saved it.
    pub fn server_save(&self, mut record: RemoteRecord) -> RemoteRecord {
        let mut state = self.state.lock();
        state.stamp(&mut record);
        let zone = state.zones.entry(record.id.zone.clone()).or_default();
        let name = record.name().to_owned();
        zone.records.insert(name.clone(), record.clone());
        zone.log.push(LogEntry::Changed(name));
        record
    }

    /// Deletes a record as if another device deleted it.
    pub fn server_delete(&self, id: &RecordId) -> bool {
        let mut state = self.state.lock();
        let Some(zone) = state.zones.get_mut(&id.zone) else {
            return false;
        };
        if zone.records.remove(&id.name).is_none() {
            return false;
        }
        zone.log.push(LogEntry::Deleted(id.name.clone()));
        true
    }

    /// Returns a stored record.
    pub fn record(&self, id: &RecordId) -> Option<RemoteRecord> {
        let state = self.state.lock();
        state.zones.get(&id.zone)?.records.get(&id.name).cloned()
    }

    /// Returns the number of records in a zone.
    pub fn record_count(&self, zone: &ZoneId) -> usize {
        self.state
            .lock()
            .zones
            .get(zone)
            .map_or(0, |zone| zone.records.len())
    }

    /// Returns the cursor each fetch started from, in order.
    pub fn fetch_cursors(&self) -> Vec<Option<Cursor>> {
        self.state.lock().fetch_log.clone()
    }

    /// Returns every push request received, in order.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.state.lock().push_log.clone()
    }

    /// Returns the number of pushes received, including held ones.
    pub fn push_attempts(&self) -> usize {
        *self.push_attempts.borrow()
    }

    /// Waits until at least `count` pushes have been received.
    pub async fn wait_for_push_attempts(&self, count: usize) {
        let mut attempts = self.push_attempts.subscribe();
        let _ = attempts.wait_for(|n| *n >= count).await;
    }

    fn check_connected(&self) -> RemoteResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RemoteError::service(
                RemoteErrorCode::NetworkUnavailable,
                "network unavailable",
            ))
        }
    }

    fn plan_fetch(&self, zone_id: &ZoneId, since: Option<Cursor>) -> RemoteResult<FetchPlan> {
        let mut state = self.state.lock();
        state.fetch_log.push(since.clone());

        if state
            .fetch_failures
            .front()
            .is_some_and(|failure| !failure.after_changes)
        {
            if let Some(failure) = state.fetch_failures.pop_front() {
                return Err(failure.error);
            }
        }

        let expired = || RemoteError::service(RemoteErrorCode::ChangeTokenExpired, "cursor expired");
        let start = match &since {
            None => 0,
            Some(cursor) => state.position(cursor).ok_or_else(expired)?,
        };

        let empty = ZoneLog::default();
        let zone = state.zones.get(zone_id).unwrap_or(&empty);
        if start > zone.log.len() {
            return Err(expired());
        }

        let mut latest: HashMap<&str, usize> = HashMap::new();
        for (index, entry) in zone.log.iter().enumerate().skip(start) {
            latest.insert(entry.name(), index);
        }

        let mut changes = Vec::new();
        let mut reported = 0;
        for (index, entry) in zone.log.iter().enumerate().skip(start) {
            if latest.get(entry.name()) != Some(&index) {
                continue;
            }
            match entry {
                LogEntry::Changed(name) => match zone.records.get(name) {
                    Some(record) => changes.push(RemoteChange::Changed(record.clone())),
                    None => continue,
                },
                // A full fetch has nothing to delete.
                LogEntry::Deleted(_) if since.is_none() => continue,
                LogEntry::Deleted(name) => changes.push(RemoteChange::Deleted(RecordId::new(
                    zone_id.clone(),
                    name.clone(),
                ))),
            }
            reported += 1;
            if state.cursor_batch > 0 && reported % state.cursor_batch == 0 && index + 1 < zone.log.len() {
                changes.push(RemoteChange::CursorUpdated(state.cursor(index + 1)));
            }
        }

        let completion = FetchCompletion {
            new_cursor: Some(state.cursor(zone.log.len())),
            has_changes: reported > 0,
        };
        let failure = match state.fetch_failures.front() {
            Some(failure) if failure.after_changes => {
                state.fetch_failures.pop_front().map(|failure| failure.error)
            }
            _ => None,
        };

        Ok(FetchPlan {
            changes,
            completion,
            failure,
        })
    }

    fn apply_push(&self, request: PushRequest) -> RemoteResult<(PushResponse, bool)> {
        let mut state = self.state.lock();
        if let Some(error) = state.push_errors.pop_front() {
            return Err(error);
        }

        let mut response = PushResponse::default();
        for save in request.saves {
            let id = save.record.id.clone();
            if let Some(error) = state.item_errors.remove(&id.name) {
                response.saved.push((id, Err(error)));
                continue;
            }

            let mut stored = state
                .zones
                .get(&request.zone)
                .and_then(|zone| zone.records.get(&id.name).cloned())
                .unwrap_or_else(|| RemoteRecord::new(id.clone(), save.record.record_type.clone()));
            for key in &save.keys {
                stored.set(key.as_str(), save.record.get(key).cloned());
            }
            state.stamp(&mut stored);

            let zone = state.zones.entry(request.zone.clone()).or_default();
            zone.records.insert(id.name.clone(), stored.clone());
            zone.log.push(LogEntry::Changed(id.name.clone()));
            response.saved.push((id, Ok(stored)));
        }

        for id in request.deletes {
            if let Some(error) = state.item_errors.remove(&id.name) {
                response.deleted.push((id, Err(error)));
                continue;
            }
            let zone = state.zones.entry(request.zone.clone()).or_default();
            let result = if zone.records.remove(&id.name).is_some() {
                zone.log.push(LogEntry::Deleted(id.name.clone()));
                Ok(())
            } else {
                Err(RemoteError::service(
                    RemoteErrorCode::UnknownItem,
                    format!("record {id} does not exist"),
                ))
            };
            response.deleted.push((id, result));
        }

        let lost = state.lost_confirmations > 0;
        if lost {
            state.lost_confirmations -= 1;
        }
        Ok((response, lost))
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteClient for MemoryRemote {
    fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::SeqCst)
    }

    async fn initialise(&self) -> RemoteResult<()> {
        self.check_connected()?;
        if let Some(error) = self.state.lock().init_error.take() {
            return Err(error);
        }
        self.initialised.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_changes(
        &self,
        zone: &ZoneId,
        since: Option<Cursor>,
        events: UnboundedSender<RemoteChange>,
    ) -> RemoteResult<FetchCompletion> {
        self.check_connected()?;
        let plan = self.plan_fetch(zone, since)?;
        for change in plan.changes {
            if events.send(change).is_err() {
                break;
            }
        }
        match plan.failure {
            Some(error) => Err(error),
            None => Ok(plan.completion),
        }
    }

    async fn push(&self, request: PushRequest) -> RemoteResult<PushResponse> {
        self.check_connected()?;
        self.state.lock().push_log.push(request.clone());
        self.push_attempts.send_modify(|n| *n += 1);

        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        self.check_connected()?;
        let (response, lost) = self.apply_push(request)?;
        if lost {
            return Err(RemoteError::service(
                RemoteErrorCode::NetworkFailure,
                "connection dropped before confirmation",
            ));
        }
        Ok(response)
    }
}
