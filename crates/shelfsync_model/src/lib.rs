//! # shelfsync Model
//!
//! Remote-side types shared by the shelfsync store and engine.
//!
//! This crate provides:
//! - `RemoteRecord` and its identity (`RecordId`, `ZoneId`)
//! - `RecordValue` for the keyed values a record carries
//! - `Cursor`, the opaque change-token value for incremental fetches
//! - The remote error taxonomy and its recovery strategies
//! - CBOR helpers for opaque serialized field values
//!
//! This is a pure types crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod encoding;
mod error;
mod record;

pub use cursor::Cursor;
pub use encoding::{from_cbor, to_cbor, CodecError, CodecResult};
pub use error::{ErrorStrategy, RemoteError, RemoteErrorCode, RemoteResult};
pub use record::{RecordId, RecordValue, RemoteRecord, SystemFields, ZoneId};
