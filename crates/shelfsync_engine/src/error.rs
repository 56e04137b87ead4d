//! Error types for the sync engine.

use shelfsync_model::{ErrorStrategy, RemoteError, RemoteErrorCode};
use shelfsync_store::StoreError;
use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why remote initialisation failed, as far as a host cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialisationFailure {
    /// The network or service could not be reached.
    Connectivity,
    /// No account is signed in.
    NotAuthenticated,
    /// Anything else.
    Other,
}

impl InitialisationFailure {
    /// Classifies an initialisation error.
    pub fn classify(error: &RemoteError) -> Self {
        match error.code() {
            Some(RemoteErrorCode::NotAuthenticated) => InitialisationFailure::NotAuthenticated,
            Some(code) if code.is_connectivity() => InitialisationFailure::Connectivity,
            _ => InitialisationFailure::Other,
        }
    }
}

impl fmt::Display for InitialisationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialisationFailure::Connectivity => f.write_str("connectivity"),
            InitialisationFailure::NotAuthenticated => f.write_str("not authenticated"),
            InitialisationFailure::Other => f.write_str("other"),
        }
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote reported an error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The local store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The remote could not be initialised.
    #[error("remote initialisation failed ({failure}): {source}")]
    RemoteInitialisation {
        /// Classification of the failure.
        failure: InitialisationFailure,
        /// Underlying remote error.
        source: RemoteError,
    },

    /// A condition the engine cannot recover from. Sync has been disabled.
    #[error("fatal sync error: {reason}")]
    Fatal {
        /// What went wrong.
        reason: String,
    },

    /// The coordinator stopped while the operation was running.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted operation.
        to: String,
    },

    /// The coordinator has shut down.
    #[error("coordinator has shut down")]
    CoordinatorClosed,
}

impl SyncError {
    /// Creates a fatal error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.strategy() == Some(ErrorStrategy::RetryLater),
            SyncError::RemoteInitialisation { failure, .. } => {
                *failure == InitialisationFailure::Connectivity
            }
            SyncError::Cancelled => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::from(RemoteError::rate_limited(Duration::from_secs(1))).is_retryable());
        assert!(!SyncError::from(RemoteError::service(
            RemoteErrorCode::QuotaExceeded,
            "full"
        ))
        .is_retryable());
        assert!(!SyncError::fatal("save failed").is_retryable());
        assert!(!SyncError::from(RemoteError::Other("boom".into())).is_retryable());
    }

    #[test]
    fn initialisation_failures_are_classified() {
        let offline = RemoteError::service(RemoteErrorCode::NetworkUnavailable, "offline");
        let signed_out = RemoteError::service(RemoteErrorCode::NotAuthenticated, "no account");
        let other = RemoteError::Other("boom".into());

        assert_eq!(
            InitialisationFailure::classify(&offline),
            InitialisationFailure::Connectivity
        );
        assert_eq!(
            InitialisationFailure::classify(&signed_out),
            InitialisationFailure::NotAuthenticated
        );
        assert_eq!(
            InitialisationFailure::classify(&other),
            InitialisationFailure::Other
        );
    }

    #[test]
    fn error_display() {
        let err = SyncError::InvalidStateTransition {
            from: "Started".into(),
            to: "replace local data".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from Started to replace local data"
        );
        assert_eq!(SyncError::Cancelled.to_string(), "sync cancelled");
    }
}
