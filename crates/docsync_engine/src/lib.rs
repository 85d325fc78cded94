//! # docsync Engine
//!
//! Client-side watch synchronization for docsync.
//!
//! This crate provides:
//! - Immutable view caches (`CacheNode`, `ViewCache`) with structural sharing
//! - A view differ producing ordered added/modified/removed/metadata changes
//! - Target lifecycle tracking that absorbs rapid listen/unlisten races
//! - A watch stream coordinator with snapshot-atomic delivery and backoff
//! - Optimistic local writes overlaid on server data
//! - An async client driving everything over one multiplexed stream
//!
//! ## Architecture
//!
//! [`SyncEngine`] is a synchronous state machine without I/O. Every entry
//! point takes `&mut self`, so transitions are serialized by construction.
//! [`SyncClient`] owns an engine inside a tokio task and feeds it commands
//! and stream events through a single loop.
//!
//! ## Key Invariants
//!
//! - A listener never observes a view that is not fully initialized
//! - Remote changes become visible only at snapshot boundaries
//! - At most one add per target is authoritative; superseded acks are ignored
//! - Local writes are overlaid in submission order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod cache_node;
mod client;
mod config;
mod engine;
mod error;
mod evaluator;
mod mutation_queue;
mod persistence;
mod remote_event;
mod target_manager;
mod transport;
mod view_cache;
mod view_diff;
mod watch;

pub use backoff::ExponentialBackoff;
pub use cache_node::{CacheNode, DocumentMap};
pub use client::SyncClient;
pub use config::{BackoffConfig, SyncConfig};
pub use engine::{ListenEvent, ListenerId, MutationHandle, SyncEngine, SyncStats, ViewSnapshot};
pub use error::{SyncError, SyncResult};
pub use evaluator::{compare_values, FieldQueryEvaluator, QueryEvaluator};
pub use mutation_queue::{BatchStatus, MutationQueue, QueueEntry};
pub use persistence::{MemoryPersistence, MutationOutcome, Persistence};
pub use remote_event::{RemoteEvent, TargetChange};
pub use target_manager::{AddOutcome, RemoveOutcome, TargetManager, TargetState};
pub use transport::{Connection, MockConnection, ServerStream, StreamChannel};
pub use view_cache::ViewCache;
pub use view_diff::{compute_changes, effective_documents, sorted_documents, ChangeKind, ViewChange};
pub use watch::{CloseOutcome, StreamState, WatchEvent, WatchStreamCoordinator};
