//! Remote error taxonomy.
//!
//! Every error code the remote can surface maps to exactly one
//! [`ErrorStrategy`]. Errors that carry no recognized code (transport
//! failures outside the remote service) have no strategy at all and are
//! logged and reported as failures by the caller.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Error codes reported by the remote record service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorCode {
    /// The supplied change cursor is no longer valid.
    ChangeTokenExpired,
    /// The zone does not exist.
    ZoneNotFound,
    /// The user deleted the zone.
    UserDeletedZone,
    /// No account is signed in.
    NotAuthenticated,
    /// The account is restricted by a management profile.
    ManagedAccountRestricted,
    /// The account is out of storage.
    QuotaExceeded,
    /// The client is too old for the remote schema.
    IncompatibleVersion,
    /// The caller lacks permission for the operation.
    PermissionFailure,
    /// The remote rejected the request as rate limited.
    RequestRateLimited,
    /// The zone is busy with other requests.
    ZoneBusy,
    /// The service is temporarily unavailable.
    ServiceUnavailable,
    /// The network failed mid-request.
    NetworkFailure,
    /// No network is available.
    NetworkUnavailable,
    /// The request was too large.
    LimitExceeded,
    /// Some items in a batch failed.
    PartialFailure,
    /// The whole batch failed because one item failed.
    BatchRequestFailed,
    /// The record was changed on the server since it was fetched.
    ServerRecordChanged,
    /// The item does not exist.
    UnknownItem,
    /// The remote rejected malformed arguments.
    InvalidArguments,
    /// The remote returned results that violate its contract.
    ServerRejectedRequest,
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the engine must react to a remote error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStrategy {
    /// Delete the stored change token and resync from scratch.
    ResetChangeToken,
    /// Stop syncing until explicitly re-enabled.
    DisableSync,
    /// A code that should never appear on this path; stop syncing.
    DisableSyncUnexpectedError,
    /// Pause syncing and retry after a delay.
    RetryLater,
    /// Retry with a smaller batch. Not supported by the engine.
    RetrySmallerBatch,
    /// Inspect per-item errors. Not supported by the engine.
    HandleInnerErrors,
    /// Resolve a version conflict. Not supported by the engine.
    HandleConcurrencyErrors,
}

impl ErrorStrategy {
    /// Returns true for the strategies the engine deliberately does not
    /// implement. Hitting one of these is a broken assumption, not a
    /// transient condition.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            ErrorStrategy::RetrySmallerBatch
                | ErrorStrategy::HandleInnerErrors
                | ErrorStrategy::HandleConcurrencyErrors
        )
    }
}

impl RemoteErrorCode {
    /// Returns the recovery strategy for this code.
    pub fn strategy(&self) -> ErrorStrategy {
        match self {
            RemoteErrorCode::ChangeTokenExpired => ErrorStrategy::ResetChangeToken,
            RemoteErrorCode::ZoneNotFound
            | RemoteErrorCode::UserDeletedZone
            | RemoteErrorCode::NotAuthenticated
            | RemoteErrorCode::ManagedAccountRestricted
            | RemoteErrorCode::QuotaExceeded
            | RemoteErrorCode::IncompatibleVersion
            | RemoteErrorCode::PermissionFailure => ErrorStrategy::DisableSync,
            RemoteErrorCode::UnknownItem
            | RemoteErrorCode::InvalidArguments
            | RemoteErrorCode::ServerRejectedRequest => ErrorStrategy::DisableSyncUnexpectedError,
            RemoteErrorCode::RequestRateLimited
            | RemoteErrorCode::ZoneBusy
            | RemoteErrorCode::ServiceUnavailable
            | RemoteErrorCode::NetworkFailure
            | RemoteErrorCode::NetworkUnavailable => ErrorStrategy::RetryLater,
            RemoteErrorCode::LimitExceeded => ErrorStrategy::RetrySmallerBatch,
            RemoteErrorCode::PartialFailure | RemoteErrorCode::BatchRequestFailed => {
                ErrorStrategy::HandleInnerErrors
            }
            RemoteErrorCode::ServerRecordChanged => ErrorStrategy::HandleConcurrencyErrors,
        }
    }

    /// Returns true if the code means the network could not be reached.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RemoteErrorCode::NetworkFailure
                | RemoteErrorCode::NetworkUnavailable
                | RemoteErrorCode::ServiceUnavailable
        )
    }
}

/// An error returned by the remote client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The remote service reported a coded error.
    #[error("remote error {code}: {message}")]
    Service {
        /// Error code.
        code: RemoteErrorCode,
        /// Suggested delay before retrying, if the remote supplied one.
        retry_after: Option<Duration>,
        /// Human-readable message.
        message: String,
    },

    /// A failure outside the remote's error taxonomy.
    #[error("unrecognized remote failure: {0}")]
    Other(String),
}

impl RemoteError {
    /// Creates a coded error with no retry hint.
    pub fn service(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        RemoteError::Service {
            code,
            retry_after: None,
            message: message.into(),
        }
    }

    /// Creates a rate-limited error carrying a retry hint.
    pub fn rate_limited(retry_after: Duration) -> Self {
        RemoteError::Service {
            code: RemoteErrorCode::RequestRateLimited,
            retry_after: Some(retry_after),
            message: "request rate limited".into(),
        }
    }

    /// Returns the error code, if the remote supplied one.
    pub fn code(&self) -> Option<RemoteErrorCode> {
        match self {
            RemoteError::Service { code, .. } => Some(*code),
            RemoteError::Other(_) => None,
        }
    }

    /// Returns the recovery strategy, or `None` for unrecognized errors.
    pub fn strategy(&self) -> Option<ErrorStrategy> {
        self.code().map(|code| code.strategy())
    }

    /// Returns the remote-supplied retry delay.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Service { retry_after, .. } => *retry_after,
            RemoteError::Other(_) => None,
        }
    }
}
