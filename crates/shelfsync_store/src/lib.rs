//! # shelfsync Store
//!
//! The local object store the sync engine runs against.
//!
//! This crate provides:
//! - `Book`, the syncable entity, and its remote record keys
//! - `ChangeToken` records, one per remote zone
//! - Declarative `Predicate`s shared by in-memory checks and bulk fetches
//! - `PersistentStore`, the durable snapshot of books and change tokens
//! - `Context`, a working copy bound to its own single-threaded queue
//! - Save notifications for merging one working copy into another
//!
//! ## Key Invariants
//!
//! - All access to a working copy is serialized onto that copy's queue
//! - A save commits books and change tokens together or not at all
//! - Save notifications are emitted only after a successful commit
//! - A save writes only the fields its working copy edited, so a copy that
//!   missed another copy's save never rolls those fields back

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod book;
mod change_token;
mod context;
mod error;
mod id;
mod notification;
mod predicate;
mod store;

pub use book::{Author, Book, ReadState, RecordKey};
pub use change_token::ChangeToken;
pub use context::{Context, ContextState};
pub use error::{StoreError, StoreResult};
pub use id::EntityId;
pub use notification::{SaveFeed, SaveNotification};
pub use predicate::{FetchRequest, Predicate};
pub use store::{BookUpdate, Changeset, PersistentStore};
