//! # docsync Testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - Document, query and field fixtures
//! - A scripted harness driving a `SyncEngine` without I/O
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[test]
//! fn listener_sees_server_documents() {
//!     let mut harness = TestEngine::connected();
//!     let mut listener = harness.listen(query("rooms"));
//!     let target_id = harness.last_added_target();
//!     harness.server_current(target_id, vec![doc("rooms/a", 1, json!({"n": 1}))], 1);
//!     assert_eq!(listener.added_keys(), vec!["rooms/a"]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use crate::init_tracing;
    pub use serde_json::json;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;

/// Installs a `tracing` subscriber honouring `RUST_LOG` for the current
/// test binary. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
