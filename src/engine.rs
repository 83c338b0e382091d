//! Process-wide wiring of the sync services.
//!
//! Everything here is constructed exactly once by [`SyncEngineBuilder::build`]
//! and shared through `Arc`s. The remote side is injected: an
//! [`OperationExecutor`] for queued mutations and a [`BatchSaver`] for
//! coalesced saves.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::batch::{BatchSaveCoordinator, BatchSaver};
use crate::cache::{owner_prefix, Cache, CacheScope, TtlTable};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::conflict::{ConflictDetector, ConflictRecord};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::db::QueueStore;
use crate::dirty::DirtyTracker;
use crate::entity::EntityType;
use crate::event::Notifier;
use crate::lock::SyncLocks;
use crate::queue::{BackgroundSync, OperationExecutor, OperationQueue};

pub struct SyncEngineBuilder {
  config: Config,
  store: Arc<dyn QueueStore>,
  executor: Arc<dyn OperationExecutor>,
  saver: Arc<dyn BatchSaver>,
  background: Option<Arc<dyn BackgroundSync>>,
  clock: Arc<dyn Clock>,
  initial: Connectivity,
}

impl SyncEngineBuilder {
  pub fn config(mut self, config: Config) -> Self {
    self.config = config;
    self
  }

  pub fn background_sync(mut self, background: Arc<dyn BackgroundSync>) -> Self {
    self.background = Some(background);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Connectivity reported until the host's network listener says otherwise.
  pub fn initial_connectivity(mut self, state: Connectivity) -> Self {
    self.initial = state;
    self
  }

  pub fn build(self) -> SyncEngine {
    let notifier = Arc::new(Notifier::new());
    let connectivity = Arc::new(ConnectivityMonitor::new(self.initial, notifier.clone()));
    let locks = SyncLocks::new();
    let cache = Arc::new(Cache::new(self.clock.clone()));
    let ttl = Arc::new(self.config.cache_ttl.table());
    let dirty = Arc::new(DirtyTracker::new(self.clock.clone()));

    let conflicts = Arc::new(
      ConflictDetector::new(notifier.clone())
        .with_tolerance_ms(self.config.conflict.tolerance_ms)
        .with_history_capacity(self.config.conflict.history_capacity)
        .with_tracked_types(self.config.conflict.tracked_entity_types.iter().cloned()),
    );

    let queue = Arc::new(
      OperationQueue::new(
        self.store,
        self.executor,
        connectivity.clone(),
        notifier.clone(),
      )
      .with_options(self.config.queue.options())
      .with_clock(self.clock.clone())
      .with_background_sync(self.background),
    );

    let batch = Arc::new(
      BatchSaveCoordinator::new(
        dirty.clone(),
        locks.batch_save.clone(),
        self.saver,
        queue.clone(),
        connectivity.clone(),
        notifier.clone(),
      )
      .with_options(self.config.batch_save.options()),
    );

    SyncEngine {
      notifier,
      connectivity,
      locks,
      cache,
      ttl,
      dirty,
      conflicts,
      queue,
      batch,
      session: Mutex::new(None),
      workers: Mutex::new(Vec::new()),
    }
  }
}

pub struct SyncEngine {
  notifier: Arc<Notifier>,
  connectivity: Arc<ConnectivityMonitor>,
  locks: SyncLocks,
  cache: Arc<Cache>,
  ttl: Arc<TtlTable>,
  dirty: Arc<DirtyTracker>,
  conflicts: Arc<ConflictDetector>,
  queue: Arc<OperationQueue>,
  batch: Arc<BatchSaveCoordinator>,
  session: Mutex<Option<CacheScope>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
  pub fn builder(
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn OperationExecutor>,
    saver: Arc<dyn BatchSaver>,
  ) -> SyncEngineBuilder {
    SyncEngineBuilder {
      config: Config::default(),
      store,
      executor,
      saver,
      background: None,
      clock: Arc::new(SystemClock),
      initial: Connectivity::Online,
    }
  }

  pub fn notifier(&self) -> &Arc<Notifier> {
    &self.notifier
  }

  pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
    &self.connectivity
  }

  pub fn locks(&self) -> &SyncLocks {
    &self.locks
  }

  pub fn cache(&self) -> &Arc<Cache> {
    &self.cache
  }

  pub fn dirty(&self) -> &Arc<DirtyTracker> {
    &self.dirty
  }

  pub fn conflicts(&self) -> &Arc<ConflictDetector> {
    &self.conflicts
  }

  pub fn queue(&self) -> &Arc<OperationQueue> {
    &self.queue
  }

  pub fn batch(&self) -> &Arc<BatchSaveCoordinator> {
    &self.batch
  }

  /// Forwarded from the host's network listener.
  pub fn set_online(&self, online: bool) {
    self.connectivity.set_online(online);
  }

  /// Scope the cache to `owner` and lift a queue paused on authentication.
  pub fn sign_in(&self, owner: &str) -> CacheScope {
    let scope = CacheScope::new(self.cache.clone(), owner, self.ttl.clone());
    *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(scope.clone());
    self.queue.set_cache_scope(Some(scope.clone()));
    self.batch.set_cache_scope(Some(scope.clone()));
    self.queue.resume();
    info!(scope = %owner_prefix(owner), "Signed in");
    scope
  }

  /// Drop the owner's cached data. Returns the number of entries removed.
  pub fn sign_out(&self) -> usize {
    let scope = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
    self.queue.set_cache_scope(None);
    self.batch.set_cache_scope(None);
    match scope {
      Some(scope) => {
        let removed = scope.invalidate_owner();
        info!("Signed out, dropped {} cached entries", removed);
        removed
      }
      None => 0,
    }
  }

  pub fn scope(&self) -> Option<CacheScope> {
    self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Spawn the queue worker and the autosave loop. Calling it again while
  /// they run does nothing.
  pub fn start(&self) {
    let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
    workers.retain(|handle| !handle.is_finished());
    if !workers.is_empty() {
      return;
    }
    workers.push(self.queue.spawn_worker());
    workers.push(self.batch.spawn_autosave());
    info!("Sync engine started ({})", self.connectivity.current());
  }

  pub fn shutdown(&self) {
    let workers: Vec<_> = self
      .workers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .drain(..)
      .collect();
    for handle in workers {
      handle.abort();
    }
  }

  /// Run a cross-device sync pass; passes never overlap.
  pub async fn run_sync<F, Fut, T>(&self, f: F) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    self.locks.sync.run_exclusive(f).await
  }

  /// Conflict check for a remote write of `entity_type`.
  pub fn check_write(
    &self,
    entity_type: EntityType,
    entity_id: &str,
    local_modified_at: Option<i64>,
    remote_modified_at: Option<i64>,
    label: Option<&str>,
  ) -> Option<ConflictRecord> {
    self.conflicts.check_write(
      entity_type,
      entity_id,
      local_modified_at,
      remote_modified_at,
      label,
    )
  }
}

impl Drop for SyncEngine {
  fn drop(&mut self) {
    self.shutdown();
  }
}
