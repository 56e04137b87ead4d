//! Configuration for the sync engine.

use shelfsync_model::ZoneId;
use std::time::Duration;

/// Name of the zone books are synced into.
pub const DEFAULT_ZONE: &str = "Books";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The single remote zone the engine syncs.
    pub zone: ZoneId,
    /// Pause used when a "pause sync" signal carries no retry-after value.
    pub default_pause: Duration,
    /// Maximum number of records sent in one push.
    pub push_batch_size: usize,
    /// Capacity of the signal bus.
    pub signal_capacity: usize,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            default_pause: Duration::from_secs(10),
            push_batch_size: 400,
            signal_capacity: 64,
        }
    }

    /// Sets the default pause.
    pub fn with_default_pause(mut self, pause: Duration) -> Self {
        self.default_pause = pause;
        self
    }

    /// Sets the push batch size. Values below one are raised to one.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the signal bus capacity.
    pub fn with_signal_capacity(mut self, capacity: usize) -> Self {
        self.signal_capacity = capacity.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(ZoneId::new(DEFAULT_ZONE))
    }
}
