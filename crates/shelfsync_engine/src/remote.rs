//! Remote client abstraction.

use shelfsync_model::{Cursor, RecordId, RemoteRecord, RemoteResult, ZoneId};
use std::future::Future;
use tokio::sync::mpsc::UnboundedSender;

/// One change reported while fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    /// A record was deleted.
    Deleted(RecordId),
    /// A record was created or updated.
    Changed(RemoteRecord),
    /// Every change reported so far is covered by this cursor.
    CursorUpdated(Cursor),
}

/// The outcome of a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCompletion {
    /// Cursor covering every reported change.
    pub new_cursor: Option<Cursor>,
    /// Whether any change was reported.
    pub has_changes: bool,
}

/// A record to create or update.
///
/// Only the listed keys are written: a listed key absent from the record
/// clears the remote value, an unlisted key is left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSave {
    /// The record, with system fields when it is known to exist remotely.
    pub record: RemoteRecord,
    /// Keys to write.
    pub keys: Vec<String>,
}

/// A batch of saves and deletes for one zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    /// Target zone.
    pub zone: ZoneId,
    /// Records to create or update.
    pub saves: Vec<RecordSave>,
    /// Records to delete.
    pub deletes: Vec<RecordId>,
}

impl PushRequest {
    /// Creates an empty request.
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            saves: Vec::new(),
            deletes: Vec::new(),
        }
    }

    /// Returns true if the request carries nothing.
    pub fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.deletes.is_empty()
    }
}

/// Per-item results of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushResponse {
    /// Result of each save, carrying the stored record on success.
    pub saved: Vec<(RecordId, RemoteResult<RemoteRecord>)>,
    /// Result of each delete.
    pub deleted: Vec<(RecordId, RemoteResult<()>)>,
}

/// A remote record service.
///
/// This trait abstracts the transport, allowing for different
/// implementations (a cloud SDK, the in-memory remote for testing, etc.).
pub trait RemoteClient: Send + Sync + 'static {
    /// Returns true once initialisation has succeeded.
    fn is_initialised(&self) -> bool;

    /// Establishes connectivity and schema. Idempotent once successful.
    fn initialise(&self) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Fetches the changes to `zone` since `since` (everything if `None`).
    ///
    /// Changes are streamed into `events` in order; the future resolves once
    /// the fetch is complete. Dropping the receiver does not fail the fetch.
    fn fetch_changes(
        &self,
        zone: &ZoneId,
        since: Option<Cursor>,
        events: UnboundedSender<RemoteChange>,
    ) -> impl Future<Output = RemoteResult<FetchCompletion>> + Send;

    /// Pushes saves and deletes.
    ///
    /// An error means the request as a whole failed; per-item failures are
    /// reported in the response.
    fn push(&self, request: PushRequest) -> impl Future<Output = RemoteResult<PushResponse>> + Send;
}
