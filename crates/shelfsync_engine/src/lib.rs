//! # shelfsync Engine
//!
//! Bidirectional sync between the local book store and a remote record zone.
//!
//! This crate provides:
//! - The `RemoteClient` contract, plus `MemoryRemote` for tests and demos
//! - The record mapper between `Book`s and remote records
//! - A downstream processor applying remote changes to the sync context
//! - Upstream processors pushing local creates, edits and deletions
//! - A signal bus for disable, pause and reachability events
//! - `SyncCoordinator`, which owns the lifecycle and wires it all together
//!
//! ## Architecture
//!
//! The host edits books in the *view* context. Every save is merged into
//! the *sync* context and the affected books are offered to the upstream
//! processors. Remote changes are fetched into the sync context and merged
//! back into the view context. The two contexts never share state directly.
//!
//! ## Key Invariants
//!
//! - A change token is persisted in the same save as the changes it covers
//! - Remote changes never overwrite keys with unconfirmed local edits
//! - A book is handed to at most one processor at a time
//! - Every push confirmation makes the book stop matching its predicate
//!   unless it was edited again while in flight
//! - Record names are derived from stable identifiers, so a repeated
//!   create updates the same record

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod downstream;
mod error;
pub mod mapper;
mod memory_remote;
mod remote;
mod signals;
mod upstream;

pub use config::{SyncConfig, DEFAULT_ZONE};
pub use coordinator::{CoordinatorState, SyncCoordinator, SYNC_CONTEXT, VIEW_CONTEXT};
pub use downstream::{DownstreamProcessor, DownstreamState, FetchResult};
pub use error::{InitialisationFailure, SyncError, SyncResult};
pub use memory_remote::MemoryRemote;
pub use remote::{FetchCompletion, PushRequest, PushResponse, RecordSave, RemoteChange, RemoteClient};
pub use signals::{Connectivity, SyncSignal, SyncSignals};
pub use upstream::{
    BookDeleter, BookUploader, ProcessCompletion, ProcessReport, UpstreamChangeProcessor,
    BOOK_DELETER, BOOK_UPLOADER,
};
