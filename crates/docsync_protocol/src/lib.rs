//! # docsync Protocol
//!
//! Document model and watch-stream message types for docsync.
//!
//! This crate provides:
//! - `Document`, `DocumentKey` and `Version`
//! - Listen targets (`Target`, `Query`, `TargetId`, `ResumeToken`)
//! - Local writes (`Mutation`, `MutationBatch`)
//! - Watch stream messages (`WatchChange`, `WatchRequest`, `StreamRequest`, `StreamEvent`)
//! - Status codes and their retry classification
//!
//! This is a pure protocol crate with no I/O operations. Wire encoding is
//! left to the transport; every type derives `serde` traits.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod messages;
mod model;
mod mutation;
mod status;
mod target;

pub use messages::{StreamEvent, StreamRequest, WatchChange, WatchRequest};
pub use model::{Document, DocumentKey, Fields, Version};
pub use mutation::{BatchId, Mutation, MutationBatch, MutationKind};
pub use status::{Status, StatusCode, StreamError};
pub use target::{FieldFilter, Query, ResumeToken, Target, TargetId};
