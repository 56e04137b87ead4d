//! Sync lifecycle orchestration.
//!
//! The [`SyncCoordinator`] owns the two working copies of the store (the
//! host's view context and the engine's sync context), runs the
//! downstream and upstream processors, and reacts to sync signals. All of
//! its bookkeeping lives in a single actor task: public methods send
//! commands and, where they return something, wait for the reply.

use crate::config::SyncConfig;
use crate::downstream::{DownstreamProcessor, FetchResult};
use crate::error::{InitialisationFailure, SyncError, SyncResult};
use crate::remote::RemoteClient;
use crate::signals::{Connectivity, SyncSignal, SyncSignals};
use crate::upstream::{BookDeleter, BookUploader, ProcessReport, UpstreamChangeProcessor};
use shelfsync_store::{Context, EntityId, PersistentStore, Predicate, SaveNotification, StoreResult};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const TARGET: &str = "shelfsync::coordinator";

/// Name of the host's working copy.
pub const VIEW_CONTEXT: &str = "viewContext";
/// Name of the engine's working copy.
pub const SYNC_CONTEXT: &str = "syncContext";

/// The lifecycle state of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Not syncing.
    Stopped,
    /// Initialising the remote and fetching its changes.
    Starting,
    /// Syncing.
    Started,
}

impl CoordinatorState {
    /// Returns true while starting or started.
    pub fn is_running(&self) -> bool {
        matches!(self, CoordinatorState::Starting | CoordinatorState::Started)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Stopped => write!(f, "stopped"),
            CoordinatorState::Starting => write!(f, "starting"),
            CoordinatorState::Started => write!(f, "started"),
        }
    }
}

enum Command {
    Start {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    MonitorReachability,
    FetchRemoteChanges {
        reply: oneshot::Sender<FetchResult>,
    },
    ProcessPending {
        entities: Option<Vec<EntityId>>,
    },
    ProcessorFinished(ProcessReport),
    ResumeAfterPause {
        generation: u64,
    },
    ReplaceLocalWithRemote {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Signal(SyncSignal),
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Orchestrates sync between a local store and a remote zone.
///
/// Sync is *wanted* from an explicit [`start`](Self::start) until an
/// explicit [`stop`](Self::stop) or a disable signal. Automatic restarts
/// (after a pause, or when the network comes back) only happen while sync
/// is wanted.
///
/// # Example
///
/// ```rust,ignore
/// use shelfsync_engine::{MemoryRemote, SyncConfig, SyncCoordinator, SyncSignals};
/// use shelfsync_store::PersistentStore;
/// use std::sync::Arc;
///
/// let config = SyncConfig::default();
/// let signals = SyncSignals::from_config(&config);
/// let coordinator = SyncCoordinator::new(
///     config,
///     PersistentStore::open("books.db")?,
///     Arc::new(MemoryRemote::new()),
///     signals,
/// )?;
/// coordinator.start().await?;
/// ```
pub struct SyncCoordinator {
    view: Context,
    sync: Context,
    signals: SyncSignals,
    state: watch::Receiver<CoordinatorState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SyncCoordinator {
    /// Creates a stopped coordinator and spawns its actor.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new<R: RemoteClient>(
        config: SyncConfig,
        store: PersistentStore,
        remote: Arc<R>,
        signals: SyncSignals,
    ) -> SyncResult<Self> {
        let view = Context::new(VIEW_CONTEXT, store.clone())?;
        let sync = Context::new(SYNC_CONTEXT, store)?;
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Stopped);
        let (commands, queue) = mpsc::unbounded_channel();

        let downstream = Arc::new(DownstreamProcessor::new(
            config.clone(),
            Arc::clone(&remote),
            sync.clone(),
            signals.clone(),
            state_rx.clone(),
        ));
        let processors: Vec<Box<dyn UpstreamChangeProcessor>> = vec![
            Box::new(BookUploader::new(
                config.clone(),
                Arc::clone(&remote),
                sync.clone(),
                signals.clone(),
            )),
            Box::new(BookDeleter::new(
                config.clone(),
                Arc::clone(&remote),
                sync.clone(),
                signals.clone(),
            )),
        ];

        let background = vec![
            observe_signals(signals.subscribe(), commands.clone()),
            merge_saves(sync.subscribe(), view.clone()),
        ];

        info!(target: TARGET, zone = %config.zone, "sync coordinator created");
        let actor = Actor {
            config,
            remote,
            view: view.clone(),
            sync: sync.clone(),
            state: state_tx,
            commands: commands.clone(),
            downstream,
            processors,
            in_flight: HashSet::new(),
            wanted: false,
            monitoring_reachability: false,
            view_observer: None,
            pause_timer: None,
            pause_generation: 0,
            background,
        };
        tokio::spawn(actor.run(queue));

        Ok(Self {
            view,
            sync,
            signals,
            state: state_rx,
            commands,
        })
    }

    /// The host's working copy.
    pub fn view_context(&self) -> &Context {
        &self.view
    }

    /// The engine's working copy.
    pub fn sync_context(&self) -> &Context {
        &self.sync
    }

    /// The signal bus the coordinator listens to.
    pub fn signals(&self) -> &SyncSignals {
        &self.signals
    }

    /// Gets the current state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn state_changes(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    /// Starts syncing, re-enabling sync if it was disabled.
    ///
    /// Resolves once started, or with the error that prevented starting.
    pub async fn start(&self) -> SyncResult<()> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Stops syncing. In-flight pushes complete but nothing new is sent.
    pub async fn stop(&self) -> SyncResult<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Stops when the network goes away and restarts when it comes back.
    ///
    /// The reachability observer survives stop and start.
    pub fn monitor_reachability(&self) -> SyncResult<()> {
        self.send(Command::MonitorReachability)
    }

    /// Handles a push notification from the remote by running one fetch
    /// cycle, then calls `completion` with its outcome.
    pub fn remote_notification_received<F>(&self, completion: F)
    where
        F: FnOnce(FetchResult) + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        if self.send(Command::FetchRemoteChanges { reply }).is_err() {
            completion(FetchResult::Failed);
            return;
        }
        tokio::spawn(async move {
            completion(response.await.unwrap_or(FetchResult::Failed));
        });
    }

    /// Runs one fetch cycle. Reports `Failed` unless started.
    pub async fn fetch_remote_changes(&self) -> FetchResult {
        self.request(|reply| Command::FetchRemoteChanges { reply })
            .await
            .unwrap_or(FetchResult::Failed)
    }

    /// Pushes every pending local change.
    pub fn process_pending_local_changes(&self) -> SyncResult<()> {
        self.send(Command::ProcessPending { entities: None })
    }

    /// Returns true if some local book has never been pushed.
    pub async fn local_only_books_exist(&self) -> SyncResult<bool> {
        let count = self
            .view
            .perform(|state| state.count(&Predicate::RemoteIdentifierIsNull))
            .await?;
        Ok(count > 0)
    }

    /// Deletes every local book and the stored change token so the next
    /// start resyncs the whole zone. Only allowed while stopped.
    pub async fn replace_local_with_remote(&self) -> SyncResult<()> {
        self.request(|reply| Command::ReplaceLocalWithRemote { reply })
            .await?
    }

    /// Stops syncing and terminates the actor.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self
            .send(Command::Shutdown { reply: Some(reply) })
            .is_ok()
        {
            let _ = response.await;
        }
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::CoordinatorClosed)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| SyncError::CoordinatorClosed)
    }
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown { reply: None });
    }
}

struct Actor<R: RemoteClient> {
    config: SyncConfig,
    remote: Arc<R>,
    view: Context,
    sync: Context,
    state: watch::Sender<CoordinatorState>,
    commands: mpsc::UnboundedSender<Command>,
    downstream: Arc<DownstreamProcessor<R>>,
    /// Run in order on every pass over pending changes.
    processors: Vec<Box<dyn UpstreamChangeProcessor>>,
    /// Entities handed to a processor whose completion has not arrived.
    in_flight: HashSet<EntityId>,
    wanted: bool,
    monitoring_reachability: bool,
    view_observer: Option<JoinHandle<()>>,
    pause_timer: Option<JoinHandle<()>>,
    pause_generation: u64,
    background: Vec<JoinHandle<()>>,
}

impl<R: RemoteClient> Actor<R> {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = queue.recv().await {
            match command {
                Command::Start { reply } => {
                    self.wanted = true;
                    self.cancel_pause();
                    let _ = reply.send(self.start().await);
                }
                Command::Stop { reply } => {
                    self.wanted = false;
                    self.cancel_pause();
                    self.stop();
                    let _ = reply.send(());
                }
                Command::MonitorReachability => {
                    debug!(target: TARGET, "monitoring reachability");
                    self.monitoring_reachability = true;
                }
                Command::FetchRemoteChanges { reply } => self.fetch_remote_changes(reply),
                Command::ProcessPending { entities } => self.process_pending(entities).await,
                Command::ProcessorFinished(report) => self.processor_finished(report).await,
                Command::ResumeAfterPause { generation } => self.resume_after_pause(generation).await,
                Command::ReplaceLocalWithRemote { reply } => {
                    let _ = reply.send(self.replace_local_with_remote().await);
                }
                Command::Signal(signal) => self.handle_signal(signal).await,
                Command::Shutdown { reply } => {
                    self.wanted = false;
                    self.cancel_pause();
                    self.stop();
                    for task in self.background.drain(..) {
                        task.abort();
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }
        debug!(target: TARGET, "coordinator shut down");
    }

    fn current(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state.send_replace(state);
    }

    async fn start(&mut self) -> SyncResult<()> {
        if self.current() == CoordinatorState::Started {
            info!(target: TARGET, "sync already started");
            return Ok(());
        }

        info!(target: TARGET, zone = %self.config.zone, "starting sync");
        self.set_state(CoordinatorState::Starting);
        match self.bring_up().await {
            Ok(()) => {
                self.process_pending(None).await;
                self.set_state(CoordinatorState::Started);
                info!(target: TARGET, "sync started");
                Ok(())
            }
            Err(e) => {
                warn!(target: TARGET, error = %e, "failed to start sync");
                self.stop();
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self) -> SyncResult<()> {
        if !self.remote.is_initialised() {
            if let Err(source) = self.remote.initialise().await {
                let failure = InitialisationFailure::classify(&source);
                match failure {
                    InitialisationFailure::Other => {
                        error!(target: TARGET, error = %source, "remote initialisation failed")
                    }
                    _ => warn!(target: TARGET, failure = %failure, "remote unavailable"),
                }
                return Err(SyncError::RemoteInitialisation { failure, source });
            }
            debug!(target: TARGET, "remote initialised");
        }

        self.observe_view_saves();
        self.sync.refresh_all().await?;
        self.downstream.process_remote_changes().await?;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(observer) = self.view_observer.take() {
            observer.abort();
        }
        if self.current() == CoordinatorState::Stopped {
            info!(target: TARGET, "sync already stopped");
            return;
        }
        self.set_state(CoordinatorState::Stopped);
        info!(target: TARGET, in_flight = self.in_flight.len(), "sync stopped");
    }

    /// Merges view saves into the sync context and pushes what they changed.
    fn observe_view_saves(&mut self) {
        if let Some(observer) = self.view_observer.take() {
            observer.abort();
        }
        let mut saves = self.view.subscribe();
        let sync = self.sync.clone();
        let commands = self.commands.clone();
        self.view_observer = Some(tokio::spawn(async move {
            while let Some(notification) = saves.recv().await {
                let entities = notification.changed_ids();
                if let Err(e) = sync.merge_changes(notification).await {
                    warn!(target: TARGET, error = %e, "failed to merge view changes");
                    break;
                }
                let pending = Command::ProcessPending {
                    entities: Some(entities),
                };
                if commands.send(pending).is_err() {
                    break;
                }
            }
        }));
    }

    fn fetch_remote_changes(&self, reply: oneshot::Sender<FetchResult>) {
        if self.current() != CoordinatorState::Started {
            info!(target: TARGET, state = %self.current(), "not started; ignoring remote changes");
            let _ = reply.send(FetchResult::Failed);
            return;
        }
        let downstream = Arc::clone(&self.downstream);
        tokio::spawn(async move {
            let result = downstream.process_remote_changes().await;
            let _ = reply.send(FetchResult::from(&result));
        });
    }

    async fn process_pending(&mut self, entities: Option<Vec<EntityId>>) {
        if !self.current().is_running() {
            debug!(target: TARGET, "not running; leaving local changes pending");
            return;
        }

        for processor in &self.processors {
            let predicate = processor.pending_predicate();
            let requested = entities.clone();
            let candidates: StoreResult<Vec<EntityId>> = self
                .sync
                .perform(move |state| match requested {
                    None => state.fetch_ids(&predicate),
                    Some(ids) => ids
                        .into_iter()
                        .filter(|id| state.get(*id).is_some_and(|book| predicate.evaluate(book)))
                        .collect(),
                })
                .await;
            let candidates = match candidates {
                Ok(candidates) => candidates,
                Err(e) => {
                    error!(target: TARGET, error = %e, "failed to query pending local changes");
                    return;
                }
            };

            let mut batch = Vec::new();
            for id in candidates {
                if self.in_flight.insert(id) {
                    batch.push(id);
                }
            }
            if batch.is_empty() {
                continue;
            }

            debug!(target: TARGET, processor = processor.name(), entities = batch.len(), "processing local changes");
            let commands = self.commands.clone();
            processor.process_local_changes(
                batch,
                Box::new(move |report| {
                    let _ = commands.send(Command::ProcessorFinished(report));
                }),
            );
        }
    }

    async fn processor_finished(&mut self, report: ProcessReport) {
        for id in &report.submitted {
            self.in_flight.remove(id);
        }
        debug!(
            target: TARGET,
            processor = report.processor,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "local changes processed"
        );
        // Edits made while a book was in flight still match a predicate.
        if !report.succeeded.is_empty() {
            self.process_pending(Some(report.succeeded)).await;
        }
    }

    async fn handle_signal(&mut self, signal: SyncSignal) {
        match signal {
            SyncSignal::Disable { reason } => {
                error!(target: TARGET, reason = %reason, "sync disabled");
                self.wanted = false;
                self.cancel_pause();
                self.stop();
            }
            SyncSignal::Pause { retry_after } => {
                let delay = retry_after.unwrap_or(self.config.default_pause);
                warn!(target: TARGET, delay_secs = delay.as_secs(), "sync paused");
                self.stop();
                if self.wanted {
                    self.schedule_resume(delay);
                }
            }
            SyncSignal::ReachabilityChanged(connectivity) => {
                if !self.monitoring_reachability {
                    return;
                }
                match connectivity {
                    Connectivity::Offline => {
                        info!(target: TARGET, "network unreachable");
                        self.stop();
                    }
                    Connectivity::Online => {
                        info!(target: TARGET, "network reachable");
                        if self.wanted && self.current() == CoordinatorState::Stopped {
                            self.cancel_pause();
                            if let Err(e) = self.start().await {
                                warn!(target: TARGET, error = %e, "failed to restart sync");
                            }
                        }
                    }
                }
            }
        }
    }

    fn schedule_resume(&mut self, delay: Duration) {
        self.cancel_pause();
        let generation = self.pause_generation;
        let commands = self.commands.clone();
        self.pause_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::ResumeAfterPause { generation });
        }));
    }

    fn cancel_pause(&mut self) {
        if let Some(timer) = self.pause_timer.take() {
            timer.abort();
        }
        self.pause_generation += 1;
    }

    async fn resume_after_pause(&mut self, generation: u64) {
        if generation != self.pause_generation {
            return;
        }
        self.pause_timer = None;
        if !self.wanted || self.current() != CoordinatorState::Stopped {
            return;
        }
        info!(target: TARGET, "resuming sync after pause");
        if let Err(e) = self.start().await {
            warn!(target: TARGET, error = %e, "failed to resume sync");
        }
    }

    async fn replace_local_with_remote(&mut self) -> SyncResult<()> {
        let current = self.current();
        if current != CoordinatorState::Stopped {
            return Err(SyncError::InvalidStateTransition {
                from: current.to_string(),
                to: "replace local with remote".into(),
            });
        }

        let zone = self.config.zone.clone();
        let deleted = self
            .sync
            .perform(move |state| -> StoreResult<usize> {
                state.refresh_all();
                let deleted = state.delete_all_books();
                state.delete_change_token(&zone);
                if let Err(e) = state.save() {
                    state.rollback();
                    return Err(e);
                }
                Ok(deleted)
            })
            .await??;
        self.view.refresh_all().await?;

        info!(target: TARGET, books = deleted, "replaced local books with remote");
        Ok(())
    }
}

/// Forwards sync signals to the actor.
fn observe_signals(
    mut signals: broadcast::Receiver<SyncSignal>,
    commands: mpsc::UnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match signals.recv().await {
                Ok(signal) => {
                    if commands.send(Command::Signal(signal)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(target: TARGET, missed, "signal listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Merges sync saves into the view context, whether or not sync is running.
fn merge_saves(
    mut saves: mpsc::UnboundedReceiver<SaveNotification>,
    view: Context,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = saves.recv().await {
            if let Err(e) = view.merge_changes(notification).await {
                warn!(target: TARGET, error = %e, "failed to merge sync changes");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_remote::MemoryRemote;

    #[test]
    fn running_states() {
        assert!(!CoordinatorState::Stopped.is_running());
        assert!(CoordinatorState::Starting.is_running());
        assert!(CoordinatorState::Started.is_running());
        assert_eq!(CoordinatorState::Started.to_string(), "started");
    }

    #[tokio::test]
    async fn created_stopped() {
        let coordinator = SyncCoordinator::new(
            SyncConfig::default(),
            PersistentStore::open_in_memory(),
            Arc::new(MemoryRemote::new()),
            SyncSignals::default(),
        )
        .unwrap();

        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
        assert_eq!(coordinator.view_context().name(), VIEW_CONTEXT);
        assert_eq!(coordinator.sync_context().name(), SYNC_CONTEXT);
        assert_eq!(coordinator.fetch_remote_changes().await, FetchResult::Failed);
    }

    #[tokio::test]
    async fn requests_fail_after_shutdown() {
        let coordinator = SyncCoordinator::new(
            SyncConfig::default(),
            PersistentStore::open_in_memory(),
            Arc::new(MemoryRemote::new()),
            SyncSignals::default(),
        )
        .unwrap();

        coordinator.shutdown().await;

        assert!(matches!(coordinator.start().await, Err(SyncError::CoordinatorClosed)));
    }
}
