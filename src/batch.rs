//! Coalesces rapid local edits into batched remote saves.
//!
//! A flush runs under the batch-save lock, writes every dirty entity in one
//! remote call, and clears only the entities the remote confirmed. When the
//! batched call fails as a whole, each entity is handed to the durable
//! operation queue instead so nothing is lost.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::CacheScope;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::dirty::{DirtyEntry, DirtyTracker};
use crate::entity::{EntityKey, EntityType};
use crate::error::{Result, SyncError};
use crate::event::{NoticeLevel, Notifier};
use crate::lock::AsyncMutex;
use crate::queue::{OperationKind, OperationQueue};

/// Per-entity result of a batched save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
  pub saved: Vec<EntityKey>,
  pub failed: Vec<(EntityKey, String)>,
}

/// Remote endpoint that persists many entities in one call.
///
/// `Ok` means the call went through, with per-entity results inside.
/// `Err` means the whole call failed and no entity may be assumed saved.
pub trait BatchSaver: Send + Sync {
  fn save_batch<'a>(&'a self, entries: &'a [DirtyEntry]) -> BoxFuture<'a, Result<BatchOutcome>>;
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
  /// Periodic autosave
  pub interval: Duration,
  /// Quiet period after the last edit before a requested save runs
  pub debounce: Duration,
}

impl Default for BatchOptions {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(30),
      debounce: Duration::from_millis(1500),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSkip {
  Offline,
  Clean,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
  pub saved: usize,
  /// Entities the remote rejected individually; still dirty
  pub failed: usize,
  /// Entities handed to the operation queue after an outright failure
  pub queued: usize,
  pub skipped: Option<FlushSkip>,
}

pub struct BatchSaveCoordinator {
  tracker: Arc<DirtyTracker>,
  lock: Arc<AsyncMutex>,
  saver: Arc<dyn BatchSaver>,
  queue: Arc<OperationQueue>,
  connectivity: Arc<ConnectivityMonitor>,
  notifier: Arc<Notifier>,
  cache: Mutex<Option<CacheScope>>,
  options: BatchOptions,
  save_requested: Notify,
}

impl BatchSaveCoordinator {
  pub fn new(
    tracker: Arc<DirtyTracker>,
    lock: Arc<AsyncMutex>,
    saver: Arc<dyn BatchSaver>,
    queue: Arc<OperationQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    notifier: Arc<Notifier>,
  ) -> Self {
    Self {
      tracker,
      lock,
      saver,
      queue,
      connectivity,
      notifier,
      cache: Mutex::new(None),
      options: BatchOptions::default(),
      save_requested: Notify::new(),
    }
  }

  pub fn with_options(mut self, options: BatchOptions) -> Self {
    self.options = options;
    self
  }

  /// Cache view to invalidate after a confirmed save.
  pub fn set_cache_scope(&self, scope: Option<CacheScope>) {
    *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = scope;
  }

  pub fn tracker(&self) -> &Arc<DirtyTracker> {
    &self.tracker
  }

  /// Record a local edit and schedule a debounced save.
  pub fn mark_dirty(&self, key: EntityKey, payload: serde_json::Value) {
    if self.tracker.mark_dirty(key.clone(), payload) {
      debug!(entity = %key, "Marked dirty");
    }
    self.save_requested.notify_one();
  }

  /// Ask the autosave loop for a save once edits settle.
  pub fn request_save(&self) {
    self.save_requested.notify_one();
  }

  /// Save everything now, bypassing the debounce.
  pub async fn force_save(&self) -> Result<FlushReport> {
    self.flush().await
  }

  /// Write all dirty entities in one batched call.
  ///
  /// Only an authentication failure is returned as an error; every other
  /// outcome is reflected in the report.
  pub async fn flush(&self) -> Result<FlushReport> {
    if !self.connectivity.is_online() {
      debug!("Offline, leaving {} entities dirty", self.tracker.len());
      return Ok(FlushReport {
        skipped: Some(FlushSkip::Offline),
        ..FlushReport::default()
      });
    }

    let _guard = self.lock.acquire().await;

    let entries = self.tracker.snapshot();
    if entries.is_empty() {
      return Ok(FlushReport {
        skipped: Some(FlushSkip::Clean),
        ..FlushReport::default()
      });
    }

    debug!("Saving {} dirty entities", entries.len());
    match self.saver.save_batch(&entries).await {
      Ok(outcome) => Ok(self.apply_outcome(&entries, outcome)),
      Err(e) if e.is_authentication() => {
        warn!("Batch save needs authentication: {}", e);
        self
          .notifier
          .notice(NoticeLevel::Error, "Sign in again to save your changes");
        Err(e)
      }
      Err(e) => Ok(self.hand_off_to_queue(&entries, &e)),
    }
  }

  fn apply_outcome(&self, entries: &[DirtyEntry], outcome: BatchOutcome) -> FlushReport {
    let mut report = FlushReport::default();
    let mut saved_types: Vec<EntityType> = Vec::new();

    for key in &outcome.saved {
      if let Some(entry) = entries.iter().find(|e| &e.key == key) {
        self.tracker.confirm(key, entry.revision);
        // Older queued writes of this entity would replay stale state
        self.queue.supersede(key);
        if !saved_types.contains(&key.entity_type) {
          saved_types.push(key.entity_type.clone());
        }
        report.saved += 1;
      }
    }
    self.invalidate_cache(&saved_types);
    for (key, reason) in &outcome.failed {
      warn!(entity = %key, "Save rejected, keeping dirty: {}", reason);
      report.failed += 1;
    }

    info!(
      "Batch save done: {} saved, {} still dirty",
      report.saved, report.failed
    );
    report
  }

  fn hand_off_to_queue(&self, entries: &[DirtyEntry], error: &SyncError) -> FlushReport {
    warn!(
      "Batch save failed, queueing {} entities individually: {}",
      entries.len(),
      error
    );

    let mut report = FlushReport::default();
    for entry in entries {
      // The newest payload replaces any earlier hand-off of the same entity
      self.queue.supersede(&entry.key);
      self
        .queue
        .enqueue_for(OperationKind::Update, &entry.key, entry.payload.clone());
      // The queue owns this revision now; a newer edit stays dirty.
      self.tracker.confirm(&entry.key, entry.revision);
      report.queued += 1;
    }
    report
  }

  fn invalidate_cache(&self, entity_types: &[EntityType]) {
    let scope = self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone();
    if let Some(scope) = scope {
      for entity_type in entity_types {
        scope.invalidate_entity_type(entity_type);
      }
    }
  }

  /// Spawn the autosave loop: periodic flushes, debounced flushes after
  /// edits, and a flush whenever connectivity comes back.
  pub fn spawn_autosave(self: &Arc<Self>) -> JoinHandle<()> {
    let coordinator = Arc::clone(self);
    tokio::spawn(async move { coordinator.run().await })
  }

  async fn run(&self) {
    let mut connectivity = self.connectivity.watch();
    let mut ticker = tokio::time::interval(self.options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        _ = ticker.tick() => {}
        _ = self.save_requested.notified() => {
          // Restart the quiet period on every new request
          loop {
            tokio::select! {
              _ = tokio::time::sleep(self.options.debounce) => break,
              _ = self.save_requested.notified() => continue,
            }
          }
        }
        changed = connectivity.changed() => {
          if changed.is_err() {
            break;
          }
          if *connectivity.borrow_and_update() != Connectivity::Online {
            continue;
          }
        }
      }

      if self.tracker.is_empty() {
        continue;
      }
      if let Err(e) = self.flush().await {
        warn!("Autosave failed: {}", e);
      }
    }
  }
}
