//! Error types for the local store.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error while persisting the store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted snapshot could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] shelfsync_model::CodecError),

    /// The store rejects writes.
    #[error("store is read-only")]
    ReadOnly,

    /// The working copy's queue has shut down.
    #[error("context {0} is closed")]
    ContextClosed(String),
}
