//! Process-wide sync signals.
//!
//! Any part of the engine (or the host) can raise a signal; the coordinator
//! consumes them. Raising a signal never blocks and never fails: with no
//! listener the signal is dropped.

use crate::config::SyncConfig;
use std::time::Duration;
use tokio::sync::broadcast;

/// Network reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// The network is reachable.
    Online,
    /// The network is unreachable.
    Offline,
}

/// A signal for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSignal {
    /// Stop syncing until explicitly re-enabled.
    Disable {
        /// Description of the originating error.
        reason: String,
    },
    /// Stop syncing and restart after a delay.
    Pause {
        /// Remote-supplied delay; the configured default applies if absent.
        retry_after: Option<Duration>,
    },
    /// Network reachability changed.
    ReachabilityChanged(Connectivity),
}

/// The signal bus.
#[derive(Debug, Clone)]
pub struct SyncSignals {
    sender: broadcast::Sender<SyncSignal>,
}

impl SyncSignals {
    /// Creates a bus holding up to `capacity` undelivered signals per listener.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Creates a bus sized by `config.signal_capacity`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.signal_capacity)
    }

    /// Raises a signal.
    pub fn emit(&self, signal: SyncSignal) {
        if self.sender.send(signal).is_err() {
            tracing::trace!("sync signal raised with no listener");
        }
    }

    /// Raises "disable sync".
    pub fn disable_sync(&self, reason: impl Into<String>) {
        self.emit(SyncSignal::Disable {
            reason: reason.into(),
        });
    }

    /// Raises "pause sync".
    pub fn pause_sync(&self, retry_after: Option<Duration>) {
        self.emit(SyncSignal::Pause { retry_after });
    }

    /// Raises "reachability changed".
    pub fn reachability_changed(&self, connectivity: Connectivity) {
        self.emit(SyncSignal::ReachabilityChanged(connectivity));
    }

    /// Listens for signals raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncSignal> {
        self.sender.subscribe()
    }
}

impl Default for SyncSignals {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
