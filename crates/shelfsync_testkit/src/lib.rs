//! # shelfsync Testkit
//!
//! Test utilities for shelfsync.
//!
//! This crate provides:
//! - Temporary stores and book builders
//! - Remote record builders
//! - Property-based test generators using proptest
//! - Log capture for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shelfsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_store() {
//!     let store = TestStore::memory();
//!     let book = BookBuilder::manual("Foo").notes("bar").build();
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
