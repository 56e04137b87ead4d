//! Integration tests for pushing local changes.

use shelfsync_engine::{
    BookDeleter, BookUploader, MemoryRemote, ProcessReport, SyncConfig, SyncSignal, SyncSignals,
    UpstreamChangeProcessor, BOOK_UPLOADER, DEFAULT_ZONE,
};
use shelfsync_model::{RecordId, RemoteError, RemoteErrorCode, ZoneId};
use shelfsync_store::{Book, Context, EntityId, RecordKey};
use shelfsync_testkit::prelude::*;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

struct Fixture {
    remote: Arc<MemoryRemote>,
    context: Context,
    bus: SyncSignals,
    signals: broadcast::Receiver<SyncSignal>,
    store: TestStore,
}

fn fixture() -> Fixture {
    init_tracing();
    let store = TestStore::memory();
    let remote = Arc::new(MemoryRemote::new());
    let context = Context::new("syncContext", store.store.clone()).unwrap();
    let bus = SyncSignals::default();
    let signals = bus.subscribe();
    Fixture {
        remote,
        context,
        bus,
        signals,
        store,
    }
}

impl Fixture {
    fn uploader(&self, config: SyncConfig) -> BookUploader<MemoryRemote> {
        BookUploader::new(
            config,
            Arc::clone(&self.remote),
            self.context.clone(),
            self.bus.clone(),
        )
    }

    fn deleter(&self) -> BookDeleter<MemoryRemote> {
        BookDeleter::new(
            SyncConfig::default(),
            Arc::clone(&self.remote),
            self.context.clone(),
            self.bus.clone(),
        )
    }

    async fn save(&self, books: Vec<Book>) -> Vec<EntityId> {
        let ids = books.iter().map(|b| b.id).collect();
        self.context
            .perform(move |state| {
                for book in books {
                    state.insert(book);
                }
                state.save().map(|_| ())
            })
            .await
            .unwrap()
            .unwrap();
        ids
    }
}

fn zone() -> ZoneId {
    ZoneId::new(DEFAULT_ZONE)
}

#[tokio::test]
async fn create_sends_every_key() {
    let f = fixture();
    let book = BookBuilder::manual("Foo").notes("bar").build();
    let name = format!("mid:{}", book.id);
    let ids = f.save(vec![book]).await;

    let report = f.uploader(SyncConfig::default()).upload(ids.clone()).await;

    assert_eq!(report.processor, BOOK_UPLOADER);
    assert_eq!(report.succeeded, ids);
    let requests = f.remote.push_requests();
    assert_eq!(requests.len(), 1);
    let save = &requests[0].saves[0];
    assert_eq!(save.keys.len(), RecordKey::ALL.len());
    assert!(save.record.system_fields.is_none());

    let stored = f.store.book(ids[0]).unwrap();
    assert_eq!(stored.remote_identifier.as_deref(), Some(name.as_str()));
    assert_eq!(
        stored.encoded_system_fields.unwrap().as_bytes(),
        b"tag-1".as_slice()
    );
    assert!(f.remote.record(&RecordId::new(zone(), name)).is_some());
}

#[tokio::test]
async fn update_sends_only_pending_keys() {
    let f = fixture();
    let book = BookBuilder::catalog("abc", "Dune")
        .notes("spice")
        .synced("gbid:abc")
        .pending(RecordKey::Notes)
        .build();
    let ids = f.save(vec![book]).await;

    let report = f.uploader(SyncConfig::default()).upload(ids.clone()).await;

    assert_eq!(report.succeeded, ids);
    let save = &f.remote.push_requests()[0].saves[0];
    assert_eq!(save.keys, vec!["notes".to_owned()]);
    assert_eq!(
        save.record.system_fields.as_ref().unwrap().as_bytes(),
        b"tag-0".as_slice()
    );
    assert!(!f.store.book(ids[0]).unwrap().has_pending_remote_keys());
}

#[tokio::test]
async fn books_no_longer_pending_are_skipped() {
    let f = fixture();
    let ids = f
        .save(vec![BookBuilder::manual("Synced").synced("mid:1").build()])
        .await;

    let report = f.uploader(SyncConfig::default()).upload(ids).await;

    assert!(report.succeeded.is_empty());
    assert!(report.failed.is_empty());
    assert!(f.remote.push_requests().is_empty());
}

#[tokio::test]
async fn lost_confirmation_retry_is_idempotent() {
    let mut f = fixture();
    let ids = f.save(vec![BookBuilder::manual("Foo").build()]).await;
    let uploader = f.uploader(SyncConfig::default());
    f.remote.lose_next_confirmation();

    let report = uploader.upload(ids.clone()).await;

    assert_eq!(report.failed, ids);
    assert_eq!(
        f.signals.try_recv().unwrap(),
        SyncSignal::Pause { retry_after: None }
    );
    assert_eq!(f.remote.record_count(&zone()), 1);
    assert!(f.store.book(ids[0]).unwrap().remote_identifier.is_none());

    let retried = uploader.upload(ids.clone()).await;

    assert_eq!(retried.succeeded, ids);
    assert_eq!(f.remote.record_count(&zone()), 1);
    assert!(f.store.book(ids[0]).unwrap().remote_identifier.is_some());
}

#[tokio::test]
async fn edits_made_in_flight_stay_pending() {
    let f = fixture();
    let ids = f.save(vec![BookBuilder::manual("Foo").build()]).await;
    let id = ids[0];
    let uploader = f.uploader(SyncConfig::default());
    f.remote.hold_pushes();

    let (tx, rx) = oneshot::channel::<ProcessReport>();
    uploader.process_local_changes(
        ids.clone(),
        Box::new(move |report| {
            let _ = tx.send(report);
        }),
    );
    f.remote.wait_for_push_attempts(1).await;

    f.context
        .perform(move |state| {
            state.modify(id, |b| b.set_notes(Some("edited".into())));
            state.save().map(|_| ())
        })
        .await
        .unwrap()
        .unwrap();
    f.remote.release_pushes();

    let report = rx.await.unwrap();
    assert_eq!(report.succeeded, ids);
    let stored = f.store.book(id).unwrap();
    assert!(stored.remote_identifier.is_some());
    assert_eq!(stored.notes.as_deref(), Some("edited"));
    assert!(stored.pending_remote_keys.contains(&RecordKey::Notes));

    uploader.upload(ids).await;
    let stored = f.store.book(id).unwrap();
    assert!(!stored.has_pending_remote_keys());
    let record = f
        .remote
        .record(&RecordId::new(zone(), format!("mid:{id}")))
        .unwrap();
    assert_eq!(
        record.get(RecordKey::Notes.as_str()).and_then(|v| v.as_text()),
        Some("edited")
    );
}

#[tokio::test]
async fn pushes_are_batched() {
    let f = fixture();
    let books = (0..5)
        .map(|i| BookBuilder::manual(&format!("Book {i}")).build())
        .collect();
    let ids = f.save(books).await;

    let report = f
        .uploader(SyncConfig::default().with_push_batch_size(2))
        .upload(ids)
        .await;

    assert_eq!(report.succeeded.len(), 5);
    let sizes: Vec<usize> = f
        .remote
        .push_requests()
        .iter()
        .map(|r| r.saves.len())
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn concurrency_errors_disable_sync() {
    let mut f = fixture();
    let book = BookBuilder::manual("Foo").build();
    let name = format!("mid:{}", book.id);
    let ids = f.save(vec![book]).await;
    f.remote.fail_item(
        &name,
        RemoteError::service(RemoteErrorCode::ServerRecordChanged, "record changed"),
    );

    let report = f.uploader(SyncConfig::default()).upload(ids.clone()).await;

    assert_eq!(report.failed, ids);
    assert!(matches!(
        f.signals.try_recv().unwrap(),
        SyncSignal::Disable { .. }
    ));
    assert!(f.store.book(ids[0]).unwrap().remote_identifier.is_none());
}

#[tokio::test]
async fn deleter_removes_remote_and_local_book() {
    let f = fixture();
    f.remote.server_save(
        RecordBuilder::book(DEFAULT_ZONE, "gbid:abc")
            .text(RecordKey::Title, "Dune")
            .build(),
    );
    let ids = f
        .save(vec![BookBuilder::catalog("abc", "Dune")
            .synced("gbid:abc")
            .pending_deletion()
            .build()])
        .await;

    let report = f.deleter().delete(ids.clone()).await;

    assert_eq!(report.succeeded, ids);
    assert!(f.remote.record(&RecordId::new(zone(), "gbid:abc")).is_none());
    assert!(f.store.book(ids[0]).is_none());
}

#[tokio::test]
async fn deleter_treats_missing_record_as_deleted() {
    let f = fixture();
    let ids = f
        .save(vec![BookBuilder::manual("Gone")
            .synced("mid:gone")
            .pending_deletion()
            .build()])
        .await;

    let report = f.deleter().delete(ids.clone()).await;

    assert_eq!(report.succeeded, ids);
    assert!(f.store.book(ids[0]).is_none());
}

#[tokio::test]
async fn deleter_disables_on_unexpected_error() {
    let mut f = fixture();
    let ids = f
        .save(vec![BookBuilder::manual("Kept")
            .synced("mid:kept")
            .pending_deletion()
            .build()])
        .await;
    f.remote.fail_item(
        "mid:kept",
        RemoteError::service(RemoteErrorCode::PermissionFailure, "denied"),
    );

    let report = f.deleter().delete(ids.clone()).await;

    assert_eq!(report.failed, ids);
    assert!(f.store.book(ids[0]).is_some());
    assert!(matches!(
        f.signals.try_recv().unwrap(),
        SyncSignal::Disable { .. }
    ));
}

#[tokio::test]
async fn whole_push_failure_reports_every_book() {
    let mut f = fixture();
    let ids = f
        .save(vec![
            BookBuilder::manual("One").build(),
            BookBuilder::manual("Two").build(),
        ])
        .await;
    f.remote.fail_next_push(RemoteError::service(
        RemoteErrorCode::QuotaExceeded,
        "quota exceeded",
    ));

    let report = f.uploader(SyncConfig::default()).upload(ids.clone()).await;

    assert_eq!(report.failed.len(), 2);
    assert!(report.succeeded.is_empty());
    assert!(matches!(
        f.signals.try_recv().unwrap(),
        SyncSignal::Disable { .. }
    ));
}
