//! Offline-first mutation queue with optimistic local state.
//!
//! Local edits are applied to an optimistic projection immediately and queued
//! durably. They are replayed in per-record order against a remote data service
//! whenever connectivity allows. Server push signals are reconciled without
//! clobbering edits that are still unsent.
//!
//! # Examples
//!
//! In-memory queue usage with [`core::queue::MutationQueue`]:
//! ```
//! use aviary_sync::{
//!     core::queue::MutationQueue,
//!     mutation::MutationDraft,
//!     types::MutationStatus,
//! };
//! use serde_json::json;
//!
//! let mut queue = MutationQueue::new();
//! let id = queue
//!     .enqueue(MutationDraft::update("birds", "b1", json!({ "name": "Luna2" })), 1)
//!     .expect("enqueue");
//!
//! let claimed = queue.dequeue_next("birds", 2).expect("dequeue").expect("ready");
//! assert_eq!(claimed.id, id);
//! assert_eq!(claimed.status, MutationStatus::InFlight);
//!
//! queue.mark_done(&id).expect("done");
//! assert!(queue.is_empty());
//! ```
//!
//! Engine usage with a SQLite-backed queue:
//! ```no_run
//! # use std::sync::Arc;
//! use aviary_sync::{
//!     core::queue::MutationQueue,
//!     mutation::MutationDraft,
//!     persist::sqlite::SqliteQueueSink,
//!     remote::{ChangeFeed, ChangeFilter, RemoteService},
//!     runtime::{
//!         config::SyncConfig,
//!         connectivity::ConnectivityMonitor,
//!         handle::{RemoteServices, spawn_sync},
//!         session::SyncSession,
//!     },
//! };
//! use serde_json::json;
//!
//! # async fn run(remote: Arc<dyn RemoteService>, feed: Arc<dyn ChangeFeed>) {
//! let sink = SqliteQueueSink::open("queue.db").expect("open sqlite");
//! let queue = MutationQueue::open(Box::new(sink)).expect("load queue");
//! let session = SyncSession::new("user-1");
//! let handle = spawn_sync(
//!     queue,
//!     RemoteServices { remote, feed },
//!     session.clone(),
//!     ConnectivityMonitor::new(true),
//!     SyncConfig::default(),
//! );
//! let _watch = handle.watch_collection("birds", ChangeFilter::owner(&session));
//! handle
//!     .mutate(MutationDraft::update("birds", "b1", json!({ "name": "Luna2" })))
//!     .expect("mutate");
//! handle.shutdown().expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Mutation queue, optimistic projection and index helpers.
pub mod core;
/// Mutation model, validation and payload application.
pub mod mutation;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Remote data service and push channel interfaces.
pub mod remote;
/// Async engine, handle and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
