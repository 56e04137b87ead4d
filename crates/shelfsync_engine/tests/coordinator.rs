//! Integration tests for the sync coordinator.

use shelfsync_engine::{
    BookUploader, Connectivity, CoordinatorState, FetchResult, InitialisationFailure,
    MemoryRemote, SyncConfig, SyncCoordinator, SyncError, SyncSignals, DEFAULT_ZONE,
};
use shelfsync_model::{RecordId, RecordValue, RemoteError, RemoteErrorCode, ZoneId};
use shelfsync_store::{Book, EntityId, Predicate, RecordKey};
use shelfsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

macro_rules! eventually {
    ($condition:expr) => {{
        let mut met = false;
        for _ in 0..500 {
            if $condition {
                met = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(met, "condition never held: {}", stringify!($condition));
    }};
}

struct Harness {
    coordinator: SyncCoordinator,
    remote: Arc<MemoryRemote>,
    signals: SyncSignals,
    store: TestStore,
}

fn harness() -> Harness {
    harness_with(SyncConfig::default())
}

fn harness_with(config: SyncConfig) -> Harness {
    init_tracing();
    let store = TestStore::memory();
    let remote = Arc::new(MemoryRemote::new());
    let signals = SyncSignals::from_config(&config);
    let coordinator = SyncCoordinator::new(
        config,
        store.store.clone(),
        Arc::clone(&remote),
        signals.clone(),
    )
    .unwrap();
    Harness {
        coordinator,
        remote,
        signals,
        store,
    }
}

fn zone() -> ZoneId {
    ZoneId::new(DEFAULT_ZONE)
}

fn record_id(name: &str) -> RecordId {
    RecordId::new(zone(), name)
}

fn remote_title(remote: &MemoryRemote, name: &str) -> Option<String> {
    remote
        .record(&record_id(name))?
        .get(RecordKey::Title.as_str())?
        .as_text()
        .map(str::to_owned)
}

impl Harness {
    async fn save_in_view(&self, book: Book) -> EntityId {
        let id = book.id;
        self.coordinator
            .view_context()
            .perform(move |state| {
                state.insert(book);
                state.save().map(|_| ())
            })
            .await
            .unwrap()
            .unwrap();
        id
    }

    async fn view_book(&self, id: EntityId) -> Option<Book> {
        self.coordinator
            .view_context()
            .perform(move |state| state.get(id).cloned())
            .await
            .unwrap()
    }

    async fn wait_for_state(&self, wanted: CoordinatorState) {
        let mut changes = self.coordinator.state_changes();
        changes.wait_for(|state| *state == wanted).await.unwrap();
    }

    fn stored_book(&self, id: EntityId) -> Option<Book> {
        self.store.book(id)
    }
}

#[tokio::test]
async fn fresh_start_downloads_remote_books() {
    let h = harness();
    h.remote.server_save(
        RecordBuilder::book(DEFAULT_ZONE, "gbid:abc")
            .text(RecordKey::Title, "Dune")
            .text(RecordKey::GoogleBooksId, "abc")
            .build(),
    );

    h.coordinator.start().await.unwrap();

    assert_eq!(h.coordinator.state(), CoordinatorState::Started);
    let books = h.store.books();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].title, "Dune");
    assert_eq!(books[0].remote_identifier.as_deref(), Some("gbid:abc"));
    assert!(h.store.change_token(&zone()).is_some());

    let id = books[0].id;
    eventually!(h.view_book(id).await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_create_is_pushed_and_confirmed() {
    let h = harness();
    h.coordinator.start().await.unwrap();

    let book = Book::new_manual("Foo");
    let name = format!("mid:{}", book.id);
    let id = h.save_in_view(book).await;

    eventually!(remote_title(&h.remote, &name).as_deref() == Some("Foo"));
    eventually!(h
        .stored_book(id)
        .is_some_and(|b| b.remote_identifier.as_deref() == Some(name.as_str())));

    let pending = BookUploader::<MemoryRemote>::predicate();
    assert!(h.store.books().iter().all(|b| !pending.evaluate(b)));
    eventually!(h
        .view_book(id)
        .await
        .is_some_and(|b| b.remote_identifier.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn book_in_flight_is_not_resubmitted() {
    let h = harness();
    h.coordinator.start().await.unwrap();
    h.remote.hold_pushes();

    let book = Book::new_manual("Foo");
    let name = format!("mid:{}", book.id);
    let id = h.save_in_view(book).await;
    h.remote.wait_for_push_attempts(1).await;

    h.coordinator
        .view_context()
        .perform(move |state| {
            state.modify(id, |b| b.set_notes(Some("edited".into())));
            state.save().map(|_| ())
        })
        .await
        .unwrap()
        .unwrap();
    h.coordinator.process_pending_local_changes().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.remote.push_attempts(), 1);

    h.remote.release_pushes();

    eventually!(h
        .remote
        .record(&record_id(&name))
        .and_then(|r| r.get(RecordKey::Notes.as_str()).cloned())
        == Some(RecordValue::Text("edited".into())));
    eventually!(h
        .stored_book(id)
        .is_some_and(|b| !b.has_pending_remote_keys() && b.remote_identifier.is_some()));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_push_pauses_then_resumes() {
    let h = harness();
    h.coordinator.start().await.unwrap();
    h.remote
        .fail_next_push(RemoteError::rate_limited(Duration::from_secs(30)));

    let book = Book::new_manual("Foo");
    let name = format!("mid:{}", book.id);
    h.save_in_view(book).await;

    h.wait_for_state(CoordinatorState::Stopped).await;
    let stopped_at = Instant::now();
    h.wait_for_state(CoordinatorState::Started).await;

    assert!(stopped_at.elapsed() >= Duration::from_secs(30));
    eventually!(h.remote.record(&record_id(&name)).is_some());
}

#[tokio::test(start_paused = true)]
async fn disable_requires_explicit_start() {
    let h = harness();
    h.coordinator.start().await.unwrap();
    h.remote
        .fail_next_push(RemoteError::service(RemoteErrorCode::QuotaExceeded, "quota exceeded"));

    let book = Book::new_manual("Foo");
    let name = format!("mid:{}", book.id);
    h.save_in_view(book).await;

    h.wait_for_state(CoordinatorState::Stopped).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);
    assert!(h.remote.record(&record_id(&name)).is_none());

    h.coordinator.start().await.unwrap();
    eventually!(h.remote.record(&record_id(&name)).is_some());
}

#[tokio::test]
async fn disable_signal_stops_sync() {
    let h = harness();
    h.coordinator.start().await.unwrap();

    h.signals.disable_sync("account gone");

    h.wait_for_state(CoordinatorState::Stopped).await;
    assert_eq!(h.coordinator.fetch_remote_changes().await, FetchResult::Failed);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let h = harness();

    h.coordinator.stop().await.unwrap();
    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);

    h.coordinator.start().await.unwrap();
    h.coordinator.start().await.unwrap();
    assert_eq!(h.coordinator.state(), CoordinatorState::Started);
    assert_eq!(h.remote.fetch_cursors().len(), 1);

    h.coordinator.stop().await.unwrap();
    h.coordinator.stop().await.unwrap();
    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);
}

#[tokio::test]
async fn remote_notification_while_stopped_fails() {
    let h = harness();
    let (tx, rx) = oneshot::channel();

    h.coordinator
        .remote_notification_received(move |result| {
            let _ = tx.send(result);
        });

    assert_eq!(rx.await.unwrap(), FetchResult::Failed);
    assert!(h.remote.fetch_cursors().is_empty());
}

#[tokio::test]
async fn remote_notification_applies_new_records() {
    let h = harness();
    h.coordinator.start().await.unwrap();
    h.remote.server_save(
        RecordBuilder::book(DEFAULT_ZONE, "mid:remote-1")
            .text(RecordKey::Title, "Emma")
            .text(RecordKey::ManualBookId, "remote-1")
            .build(),
    );
    let (tx, rx) = oneshot::channel();

    h.coordinator
        .remote_notification_received(move |result| {
            let _ = tx.send(result);
        });

    assert_eq!(rx.await.unwrap(), FetchResult::NewData);
    assert_eq!(h.store.book_count(), 1);
    assert_eq!(h.coordinator.fetch_remote_changes().await, FetchResult::NoData);
}

#[tokio::test]
async fn remote_deletion_removes_local_book() {
    let h = harness();
    h.remote.server_save(
        RecordBuilder::book(DEFAULT_ZONE, "gbid:abc")
            .text(RecordKey::Title, "Dune")
            .text(RecordKey::GoogleBooksId, "abc")
            .build(),
    );
    h.coordinator.start().await.unwrap();
    let id = h.store.books()[0].id;
    eventually!(h.view_book(id).await.is_some());

    h.remote.server_delete(&record_id("gbid:abc"));
    assert_eq!(h.coordinator.fetch_remote_changes().await, FetchResult::NewData);

    assert_eq!(h.store.book_count(), 0);
    eventually!(h.view_book(id).await.is_none());
}

#[tokio::test]
async fn expired_change_token_is_reset() {
    let h = harness();
    h.remote.server_save(
        RecordBuilder::book(DEFAULT_ZONE, "gbid:abc")
            .text(RecordKey::Title, "Dune")
            .text(RecordKey::GoogleBooksId, "abc")
            .build(),
    );
    h.coordinator.start().await.unwrap();
    assert!(h.store.change_token(&zone()).is_some());

    h.remote.expire_change_tokens();
    assert_eq!(h.coordinator.fetch_remote_changes().await, FetchResult::Failed);
    assert!(h.store.change_token(&zone()).is_none());

    assert_eq!(h.coordinator.fetch_remote_changes().await, FetchResult::NewData);
    assert_eq!(h.remote.fetch_cursors().last(), Some(&None));
    assert_eq!(h.store.book_count(), 1);
    assert!(h.store.change_token(&zone()).is_some());
}

#[tokio::test]
async fn local_deletion_reaches_remote() {
    let h = harness();
    h.remote.server_save(
        RecordBuilder::book(DEFAULT_ZONE, "gbid:abc")
            .text(RecordKey::Title, "Dune")
            .text(RecordKey::GoogleBooksId, "abc")
            .build(),
    );
    h.coordinator.start().await.unwrap();
    let id = h.store.books()[0].id;
    eventually!(h.view_book(id).await.is_some());

    h.coordinator
        .view_context()
        .perform(move |state| {
            state.delete_or_mark_for_remote_deletion(id);
            state.save().map(|_| ())
        })
        .await
        .unwrap()
        .unwrap();

    eventually!(h.remote.record(&record_id("gbid:abc")).is_none());
    eventually!(h.stored_book(id).is_none());
}

#[tokio::test]
async fn replace_local_with_remote_requires_stopped() {
    let h = harness();
    h.remote.server_save(
        RecordBuilder::book(DEFAULT_ZONE, "gbid:abc")
            .text(RecordKey::Title, "Dune")
            .text(RecordKey::GoogleBooksId, "abc")
            .build(),
    );
    h.coordinator.start().await.unwrap();

    let result = h.coordinator.replace_local_with_remote().await;
    assert!(matches!(result, Err(SyncError::InvalidStateTransition { .. })));

    h.coordinator.stop().await.unwrap();
    h.save_in_view(Book::new_manual("Local only")).await;
    assert!(h.coordinator.local_only_books_exist().await.unwrap());

    h.coordinator.replace_local_with_remote().await.unwrap();
    assert_eq!(h.store.book_count(), 0);
    assert!(h.store.change_token(&zone()).is_none());
    assert!(!h.coordinator.local_only_books_exist().await.unwrap());

    h.coordinator.start().await.unwrap();
    let books = h.store.books();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].title, "Dune");
}

#[tokio::test]
async fn reachability_stops_and_restarts() {
    let h = harness();
    h.coordinator.monitor_reachability().unwrap();
    h.coordinator.start().await.unwrap();

    h.remote.set_connected(false);
    h.signals.reachability_changed(Connectivity::Offline);
    h.wait_for_state(CoordinatorState::Stopped).await;

    h.remote.set_connected(true);
    h.signals.reachability_changed(Connectivity::Online);
    h.wait_for_state(CoordinatorState::Started).await;
}

#[tokio::test]
async fn reachability_ignored_unless_monitored() {
    let h = harness();
    h.coordinator.start().await.unwrap();

    h.signals.reachability_changed(Connectivity::Offline);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.coordinator.state(), CoordinatorState::Started);
}

#[tokio::test]
async fn network_restored_after_explicit_stop_stays_stopped() {
    let h = harness();
    h.coordinator.monitor_reachability().unwrap();
    h.coordinator.start().await.unwrap();
    h.coordinator.stop().await.unwrap();

    h.signals.reachability_changed(Connectivity::Online);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);
}

#[tokio::test]
async fn initialisation_failure_leaves_sync_stopped() {
    let h = harness();
    h.remote.fail_initialisation(RemoteError::service(
        RemoteErrorCode::NotAuthenticated,
        "no account",
    ));

    let result = h.coordinator.start().await;

    assert!(matches!(
        result,
        Err(SyncError::RemoteInitialisation {
            failure: InitialisationFailure::NotAuthenticated,
            ..
        })
    ));
    assert_eq!(h.coordinator.state(), CoordinatorState::Stopped);

    h.coordinator.start().await.unwrap();
    assert_eq!(h.coordinator.state(), CoordinatorState::Started);
}

#[tokio::test]
async fn offline_start_reports_connectivity() {
    let h = harness();
    h.remote.set_connected(false);

    let result = h.coordinator.start().await;

    assert!(matches!(
        result,
        Err(SyncError::RemoteInitialisation {
            failure: InitialisationFailure::Connectivity,
            ..
        })
    ));
}

#[tokio::test]
async fn edits_made_while_stopped_are_pushed_on_start() {
    let h = harness();
    let book = Book::new_manual("Offline");
    let name = format!("mid:{}", book.id);
    h.save_in_view(book).await;

    h.coordinator.start().await.unwrap();

    eventually!(remote_title(&h.remote, &name).as_deref() == Some("Offline"));
    eventually!(h
        .store
        .books()
        .iter()
        .all(|b| !Predicate::RemoteIdentifierIsNull.evaluate(b)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsaved_view_edit_survives_upload_confirmation() {
    let h = harness();
    h.coordinator.start().await.unwrap();
    h.remote.hold_pushes();

    let book = Book::new_manual("Foo");
    let name = format!("mid:{}", book.id);
    let id = h.save_in_view(book).await;
    h.remote.wait_for_push_attempts(1).await;

    h.coordinator
        .view_context()
        .perform(move |state| {
            state.modify(id, |b| b.set_notes(Some("draft".into())));
        })
        .await
        .unwrap();
    h.remote.release_pushes();

    eventually!(h
        .view_book(id)
        .await
        .is_some_and(|b| b.remote_identifier.as_deref() == Some(name.as_str())));
    assert_eq!(
        h.view_book(id).await.unwrap().notes.as_deref(),
        Some("draft")
    );

    h.coordinator
        .view_context()
        .perform(|state| state.save().map(|_| ()))
        .await
        .unwrap()
        .unwrap();

    let stored = h.stored_book(id).unwrap();
    assert_eq!(stored.remote_identifier.as_deref(), Some(name.as_str()));
    assert_eq!(stored.notes.as_deref(), Some("draft"));
    eventually!(h
        .remote
        .record(&record_id(&name))
        .and_then(|r| r.get(RecordKey::Notes.as_str()).cloned())
        == Some(RecordValue::Text("draft".into())));
    eventually!(h
        .stored_book(id)
        .is_some_and(|b| !b.has_pending_remote_keys()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsaved_view_edit_survives_download() {
    let h = harness();
    h.remote.server_save(
        RecordBuilder::book(DEFAULT_ZONE, "gbid:abc")
            .text(RecordKey::Title, "Dune")
            .text(RecordKey::GoogleBooksId, "abc")
            .build(),
    );
    h.coordinator.start().await.unwrap();
    let id = h.store.books()[0].id;
    eventually!(h.view_book(id).await.is_some());

    h.coordinator
        .view_context()
        .perform(move |state| {
            state.modify(id, |b| b.set_notes(Some("draft".into())));
        })
        .await
        .unwrap();
    h.remote.server_save(
        RecordBuilder::book(DEFAULT_ZONE, "gbid:abc")
            .text(RecordKey::Title, "Dune Messiah")
            .text(RecordKey::GoogleBooksId, "abc")
            .build(),
    );
    assert_eq!(h.coordinator.fetch_remote_changes().await, FetchResult::NewData);

    eventually!(h
        .view_book(id)
        .await
        .is_some_and(|b| b.title == "Dune Messiah"));
    assert_eq!(
        h.view_book(id).await.unwrap().notes.as_deref(),
        Some("draft")
    );

    h.coordinator
        .view_context()
        .perform(|state| state.save().map(|_| ()))
        .await
        .unwrap()
        .unwrap();

    let stored = h.stored_book(id).unwrap();
    assert_eq!(stored.title, "Dune Messiah");
    assert_eq!(stored.remote_identifier.as_deref(), Some("gbid:abc"));
    eventually!(h
        .remote
        .record(&record_id("gbid:abc"))
        .and_then(|r| r.get(RecordKey::Notes.as_str()).cloned())
        == Some(RecordValue::Text("draft".into())));
}

#[tokio::test]
async fn pending_books_are_submitted_before_started() {
    let h = harness();
    let book = Book::new_manual("Offline");
    let name = format!("mid:{}", book.id);
    h.save_in_view(book).await;
    h.remote.hold_pushes();
    let mut states = h.coordinator.state_changes();

    let seen = tokio::spawn(async move {
        let mut seen = vec![*states.borrow_and_update()];
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            seen.push(state);
            if state == CoordinatorState::Started {
                break;
            }
        }
        seen
    });
    h.coordinator.start().await.unwrap();

    assert_eq!(
        seen.await.unwrap(),
        vec![
            CoordinatorState::Stopped,
            CoordinatorState::Starting,
            CoordinatorState::Started
        ]
    );
    h.coordinator.process_pending_local_changes().unwrap();
    h.remote.wait_for_push_attempts(1).await;
    h.remote.release_pushes();
    eventually!(remote_title(&h.remote, &name).as_deref() == Some("Offline"));
    assert_eq!(h.remote.push_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_batch_size_still_pushes() {
    let mut config = SyncConfig::default();
    config.push_batch_size = 0;
    let h = harness_with(config);
    h.coordinator.start().await.unwrap();

    let first = Book::new_manual("First");
    let second = Book::new_manual("Second");
    let names = [format!("mid:{}", first.id), format!("mid:{}", second.id)];
    h.save_in_view(first).await;
    h.save_in_view(second).await;

    eventually!(remote_title(&h.remote, &names[0]).as_deref() == Some("First"));
    eventually!(remote_title(&h.remote, &names[1]).as_deref() == Some("Second"));
    assert_eq!(h.coordinator.state(), CoordinatorState::Started);
}
