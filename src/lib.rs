//! Offline-first sync layer for a personal planner.
//!
//! Local edits are never blocked on the network. Remote mutations go through
//! a durable [`queue::OperationQueue`] that retries with a bounded budget,
//! rapid edits are coalesced by [`batch::BatchSaveCoordinator`], reads go
//! through a scoped TTL [`cache`], and [`conflict::ConflictDetector`] reports
//! where a newer remote write was overwritten. [`engine::SyncEngine`] wires
//! all of it together.

pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod db;
pub mod dirty;
pub mod engine;
pub mod entity;
pub mod error;
pub mod event;
pub mod lock;
pub mod queue;

pub use engine::{SyncEngine, SyncEngineBuilder};
pub use entity::{EntityKey, EntityType};
pub use error::{Result, SyncError};
