//! Durable, retrying queue of pending remote mutations.
//!
//! Each operation moves `Pending -> Retrying -> (Succeeded | Failed-Terminal)`.
//! The live list and the terminal failure list are persisted as two separate
//! JSON blobs. Only the processing pass mutates them, apart from enqueue
//! (append) and the operator actions on the failure list.
//!
//! Attempts are only counted for failures that say something about the
//! operation itself. Being offline or unauthenticated never burns retries.

mod background;
mod executor;
mod operation;

pub use background::{BackgroundSync, BackgroundSyncStatus};
pub use executor::{ExecutorRegistry, OperationExecutor};
pub use operation::{parse_operations, OperationKind, QueuedOperation};

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::CacheScope;
use crate::clock::{Clock, SystemClock};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::db::QueueStore;
use crate::entity::{EntityKey, EntityType};
use crate::event::{NoticeLevel, Notifier, QueueCorrupted, QueueEvent, TerminalFailure};

/// Attempts before an operation is moved to the failure list.
pub const MAX_RETRIES: u32 = 3;
pub const QUEUE_STORAGE_KEY: &str = "sync_queue";
pub const FAILED_STORAGE_KEY: &str = "sync_queue_failed";
pub const BACKGROUND_SYNC_TAG: &str = "plansync-queue";

#[derive(Debug, Clone)]
pub struct QueueOptions {
  pub max_retries: u32,
  /// Period of the worker's retry tick
  pub process_interval: Duration,
}

impl Default for QueueOptions {
  fn default() -> Self {
    Self {
      max_retries: MAX_RETRIES,
      process_interval: Duration::from_secs(30),
    }
  }
}

/// Why a processing pass did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  Offline,
  /// Waiting for re-authentication, see [`OperationQueue::resume`]
  Paused,
  AlreadyRunning,
  Empty,
}

/// Summary of one processing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
  /// Executor calls made
  pub attempted: usize,
  pub succeeded: usize,
  /// Failed attempts that stay queued
  pub retried: usize,
  /// Operations moved to the failure list
  pub failed: usize,
  /// Pass stopped early on a network failure; nothing was counted
  pub interrupted: bool,
  pub skipped: Option<SkipReason>,
}

impl PassReport {
  fn skipped(reason: SkipReason) -> Self {
    Self {
      skipped: Some(reason),
      ..Self::default()
    }
  }
}

#[derive(Debug, Default)]
struct QueueState {
  live: Vec<QueuedOperation>,
  failed: Vec<QueuedOperation>,
  /// Storage keys whose blob could not be read. They are never written
  /// until a read succeeds, so the stored operations survive.
  unread: Vec<&'static str>,
}

enum FailureOutcome {
  Retry,
  Terminal,
  Gone,
}

/// Clears the re-entrancy flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct OperationQueue {
  state: Mutex<QueueState>,
  store: Arc<dyn QueueStore>,
  executor: Arc<dyn OperationExecutor>,
  connectivity: Arc<ConnectivityMonitor>,
  notifier: Arc<Notifier>,
  clock: Arc<dyn Clock>,
  cache: Mutex<Option<CacheScope>>,
  background: Option<Arc<dyn BackgroundSync>>,
  options: QueueOptions,
  processing: AtomicBool,
  paused: AtomicBool,
  kick: Notify,
}

impl OperationQueue {
  /// Create the queue and load both persisted lists.
  ///
  /// A blob that fails validation is discarded as a whole, reset to an empty
  /// list and reported through [`Notifier::queue_corrupted`].
  pub fn new(
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn OperationExecutor>,
    connectivity: Arc<ConnectivityMonitor>,
    notifier: Arc<Notifier>,
  ) -> Self {
    let mut unread = Vec::new();
    let live = load_list(store.as_ref(), &notifier, QUEUE_STORAGE_KEY).unwrap_or_else(|| {
      unread.push(QUEUE_STORAGE_KEY);
      Vec::new()
    });
    let failed = load_list(store.as_ref(), &notifier, FAILED_STORAGE_KEY).unwrap_or_else(|| {
      unread.push(FAILED_STORAGE_KEY);
      Vec::new()
    });
    if !unread.is_empty() {
      notifier.notice(
        NoticeLevel::Warning,
        "Saved changes could not be read yet. They are kept and will be retried",
      );
    }
    if !live.is_empty() || !failed.is_empty() {
      info!(
        "Loaded sync queue: {} pending, {} failed",
        live.len(),
        failed.len()
      );
    }

    Self {
      state: Mutex::new(QueueState {
        live,
        failed,
        unread,
      }),
      store,
      executor,
      connectivity,
      notifier,
      clock: Arc::new(SystemClock),
      cache: Mutex::new(None),
      background: None,
      options: QueueOptions::default(),
      processing: AtomicBool::new(false),
      paused: AtomicBool::new(false),
      kick: Notify::new(),
    }
  }

  pub fn with_options(mut self, options: QueueOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_background_sync(mut self, background: Option<Arc<dyn BackgroundSync>>) -> Self {
    self.background = background;
    self
  }

  /// Cache view to invalidate after operations settle. Changes with the
  /// signed-in identity.
  pub fn set_cache_scope(&self, scope: Option<CacheScope>) {
    *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = scope;
  }

  fn state(&self) -> MutexGuard<'_, QueueState> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if !state.unread.is_empty() {
      self.reload_unread(&mut state);
    }
    state
  }

  /// Retry lists whose stored blob was unreadable. Stored operations go
  /// first, followed by anything added in memory since.
  fn reload_unread(&self, state: &mut QueueState) {
    for key in std::mem::take(&mut state.unread) {
      let Some(stored) = load_list(self.store.as_ref(), &self.notifier, key) else {
        state.unread.push(key);
        continue;
      };
      let list = if key == QUEUE_STORAGE_KEY {
        &mut state.live
      } else {
        &mut state.failed
      };
      let added = std::mem::replace(list, stored);
      info!("Recovered {} stored operations from {}", list.len(), key);
      for op in added {
        if !list.iter().any(|existing| existing.id == op.id) {
          list.push(op);
        }
      }
      self.write(key, list);
    }
  }

  /// Append an operation and persist the queue. Never waits on the network;
  /// when online the worker is woken to process it.
  pub fn enqueue(&self, kind: OperationKind, entity_type: EntityType, payload: Value) -> QueuedOperation {
    self.push(kind, entity_type, None, payload)
  }

  /// Like [`enqueue`](Self::enqueue) for a write of one known entity. A later
  /// [`supersede`](Self::supersede) of that entity drops it.
  pub fn enqueue_for(&self, kind: OperationKind, key: &EntityKey, payload: Value) -> QueuedOperation {
    self.push(kind, key.entity_type.clone(), Some(key.id.clone()), payload)
  }

  fn push(
    &self,
    kind: OperationKind,
    entity_type: EntityType,
    entity_id: Option<String>,
    payload: Value,
  ) -> QueuedOperation {
    let op = QueuedOperation {
      id: Uuid::now_v7().to_string(),
      kind,
      entity_type,
      entity_id,
      payload,
      enqueued_at: self.clock.now_ms(),
      attempt_count: 0,
    };

    let pending = {
      let mut state = self.state();
      state.live.push(op.clone());
      self.persist(&state, QUEUE_STORAGE_KEY);
      state.live.len()
    };

    info!(id = %op.id, "Queued {} {} ({} pending)", op.kind, op.entity_type, pending);
    self.notifier.queue(QueueEvent::Enqueued {
      id: op.id.clone(),
      pending,
    });
    self.register_background_sync();

    if self.connectivity.is_online() {
      self.kick.notify_one();
    }

    op
  }

  /// Ask the platform to wake us for background retries. Best effort.
  pub fn register_background_sync(&self) -> BackgroundSyncStatus {
    match &self.background {
      None => BackgroundSyncStatus::Unavailable,
      Some(background) => match background.register(BACKGROUND_SYNC_TAG) {
        Ok(()) => BackgroundSyncStatus::Registered,
        Err(e) => {
          debug!("Background sync registration failed: {}", e);
          BackgroundSyncStatus::Failed(e.to_string())
        }
      },
    }
  }

  /// Run one processing pass over a snapshot of the live queue.
  ///
  /// Only one pass runs at a time; a pass requested meanwhile returns
  /// [`SkipReason::AlreadyRunning`] and the next trigger picks up the rest.
  pub async fn process_pending(&self) -> PassReport {
    if !self.connectivity.is_online() {
      return PassReport::skipped(SkipReason::Offline);
    }
    if self.paused.load(Ordering::Acquire) {
      return PassReport::skipped(SkipReason::Paused);
    }
    if self
      .processing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return PassReport::skipped(SkipReason::AlreadyRunning);
    }
    let _guard = PassGuard(&self.processing);

    let snapshot = self.state().live.clone();
    if snapshot.is_empty() {
      return PassReport::skipped(SkipReason::Empty);
    }

    debug!("Processing {} queued operations", snapshot.len());
    let mut report = PassReport::default();

    for op in &snapshot {
      if !self.connectivity.is_online() {
        report.interrupted = true;
        break;
      }

      // Superseded or discarded since the snapshot was taken
      if !self.state().live.iter().any(|live| live.id == op.id) {
        continue;
      }

      report.attempted += 1;
      match self.executor.execute(op).await {
        Ok(()) => {
          self.complete(&op.id);
          report.succeeded += 1;
          self.invalidate_cache(&op.entity_type);
        }
        Err(e) if e.is_network() => {
          info!(id = %op.id, "Network unavailable, pausing queue pass: {}", e);
          report.interrupted = true;
          break;
        }
        Err(e) if e.is_authentication() => {
          warn!(id = %op.id, "Authentication required, queue paused: {}", e);
          self.paused.store(true, Ordering::Release);
          self.notifier.notice(
            NoticeLevel::Error,
            "Sign in again to finish saving your offline changes",
          );
          report.interrupted = true;
          break;
        }
        Err(e) => match self.record_failure(&op.id, &e.to_string()) {
          FailureOutcome::Retry => report.retried += 1,
          FailureOutcome::Terminal => {
            report.failed += 1;
            self.invalidate_cache(&op.entity_type);
          }
          FailureOutcome::Gone => {}
        },
      }
    }

    {
      let state = self.state();
      self.persist(&state, QUEUE_STORAGE_KEY);
    }

    info!(
      "Queue pass done: {} succeeded, {} retrying, {} failed",
      report.succeeded, report.retried, report.failed
    );
    report
  }

  fn complete(&self, id: &str) {
    let pending = {
      let mut state = self.state();
      state.live.retain(|op| op.id != id);
      state.live.len()
    };
    debug!(id, "Operation succeeded");
    self.notifier.queue(QueueEvent::Succeeded {
      id: id.to_string(),
      pending,
    });
  }

  fn record_failure(&self, id: &str, reason: &str) -> FailureOutcome {
    let mut state = self.state();
    let Some(index) = state.live.iter().position(|op| op.id == id) else {
      return FailureOutcome::Gone;
    };

    state.live[index].attempt_count += 1;
    let attempt_count = state.live[index].attempt_count;

    if attempt_count < self.options.max_retries {
      drop(state);
      warn!(id, attempt_count, "Operation failed, will retry: {}", reason);
      self.notifier.queue(QueueEvent::Retrying {
        id: id.to_string(),
        attempt_count,
      });
      return FailureOutcome::Retry;
    }

    let op = state.live.remove(index);
    state.failed.push(op.clone());
    // Both lists in one critical section, so a crash cannot leave the
    // operation in both
    self.persist(&state, QUEUE_STORAGE_KEY);
    self.persist(&state, FAILED_STORAGE_KEY);
    drop(state);

    error!(
      id,
      attempt_count, "Operation failed permanently, moved to failure list: {}", reason
    );
    self.notifier.queue(QueueEvent::Failed { id: id.to_string() });
    self.notifier.terminal_failure(TerminalFailure {
      operation: op,
      reason: reason.to_string(),
    });
    FailureOutcome::Terminal
  }

  fn invalidate_cache(&self, entity_type: &EntityType) {
    let scope = self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone();
    if let Some(scope) = scope {
      scope.invalidate_entity_type(entity_type);
    }
  }

  /// Write the list stored under `key`, unless its stored copy was never read.
  fn persist(&self, state: &QueueState, key: &str) {
    if state.unread.iter().any(|unread| *unread == key) {
      warn!("Not writing {} before its stored copy can be read", key);
      return;
    }
    let ops = if key == QUEUE_STORAGE_KEY {
      &state.live
    } else {
      &state.failed
    };
    self.write(key, ops);
  }

  /// Write a list to storage. Failures are logged and swallowed: losing one
  /// durability write is better than taking the app down.
  fn write(&self, key: &str, ops: &[QueuedOperation]) {
    let blob = match serde_json::to_string(ops) {
      Ok(blob) => blob,
      Err(e) => {
        error!("Failed to serialize {}: {}", key, e);
        return;
      }
    };
    if let Err(e) = self.store.save(key, &blob) {
      warn!("Failed to persist {}: {}", key, e);
    }
  }

  /// Operations still waiting to be sent, in enqueue order.
  pub fn pending(&self) -> Vec<QueuedOperation> {
    self.state().live.clone()
  }

  pub fn len(&self) -> usize {
    self.state().live.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state().live.is_empty()
  }

  /// Operations that exhausted their retries.
  pub fn failed(&self) -> Vec<QueuedOperation> {
    self.state().failed.clone()
  }

  /// Move a terminal failure back into the live queue with a fresh retry budget.
  pub fn retry_failed(&self, id: &str) -> bool {
    let moved = {
      let mut state = self.state();
      let Some(index) = state.failed.iter().position(|op| op.id == id) else {
        return false;
      };
      let mut op = state.failed.remove(index);
      op.attempt_count = 0;
      state.live.push(op);
      self.persist(&state, FAILED_STORAGE_KEY);
      self.persist(&state, QUEUE_STORAGE_KEY);
      true
    };

    info!(id, "Failed operation returned to queue");
    self.notifier.queue(QueueEvent::Requeued { id: id.to_string() });
    if self.connectivity.is_online() {
      self.kick.notify_one();
    }
    moved
  }

  pub fn retry_all_failed(&self) -> usize {
    let ids: Vec<String> = self.state().failed.iter().map(|op| op.id.clone()).collect();
    ids.iter().filter(|id| self.retry_failed(id)).count()
  }

  /// Drop a terminal failure for good.
  pub fn discard_failed(&self, id: &str) -> Option<QueuedOperation> {
    let op = {
      let mut state = self.state();
      let index = state.failed.iter().position(|op| op.id == id)?;
      let op = state.failed.remove(index);
      self.persist(&state, FAILED_STORAGE_KEY);
      op
    };

    info!(id, "Failed operation discarded");
    self.notifier.queue(QueueEvent::Discarded { id: id.to_string() });
    Some(op)
  }

  pub fn clear_failed(&self) -> usize {
    let ids: Vec<String> = self.state().failed.iter().map(|op| op.id.clone()).collect();
    ids
      .iter()
      .filter(|id| self.discard_failed(id).is_some())
      .count()
  }

  /// Drop live operations that write `key` because a newer version of the
  /// entity was confirmed through another path. An attempt already in flight
  /// is not recalled.
  pub fn supersede(&self, key: &EntityKey) -> usize {
    let (removed, pending) = {
      let mut state = self.state();
      let removed: Vec<String> = state
        .live
        .iter()
        .filter(|op| op.targets(key))
        .map(|op| op.id.clone())
        .collect();
      if removed.is_empty() {
        return 0;
      }
      state.live.retain(|op| !op.targets(key));
      self.persist(&state, QUEUE_STORAGE_KEY);
      (removed, state.live.len())
    };

    for id in &removed {
      info!(id = %id, entity = %key, "Queued write superseded by a newer save");
      self.notifier.queue(QueueEvent::Superseded {
        id: id.clone(),
        pending,
      });
    }
    removed.len()
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::Acquire)
  }

  /// Lift the authentication pause after the user signed in again.
  pub fn resume(&self) {
    if self.paused.swap(false, Ordering::AcqRel) {
      info!("Queue resumed");
      if self.connectivity.is_online() {
        self.kick.notify_one();
      }
    }
  }

  /// Wake the worker for an immediate pass.
  pub fn trigger(&self) {
    self.kick.notify_one();
  }

  /// Spawn the background loop that runs passes on enqueue, on the retry
  /// tick while online and non-empty, and when connectivity is restored.
  pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
    let queue = Arc::clone(self);
    tokio::spawn(async move { queue.run().await })
  }

  async fn run(&self) {
    let mut connectivity = self.connectivity.watch();
    let mut ticker = tokio::time::interval(self.options.process_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        _ = self.kick.notified() => {}
        _ = ticker.tick() => {
          if self.is_empty() || !self.connectivity.is_online() {
            continue;
          }
        }
        changed = connectivity.changed() => {
          if changed.is_err() {
            break;
          }
          if *connectivity.borrow_and_update() != Connectivity::Online {
            continue;
          }
          info!("Connectivity restored, flushing sync queue");
        }
      }

      self.process_pending().await;
    }
  }
}

/// Load one persisted list, resetting it if it fails validation.
///
/// `None` means the store could not be read at all; the blob may be intact.
fn load_list(store: &dyn QueueStore, notifier: &Notifier, key: &str) -> Option<Vec<QueuedOperation>> {
  let blob = match store.load(key) {
    Ok(Some(blob)) => blob,
    Ok(None) => return Some(Vec::new()),
    Err(e) => {
      error!("Failed to read {}: {}", key, e);
      return None;
    }
  };

  match parse_operations(&blob) {
    Ok(ops) => Some(ops),
    Err(reason) => {
      error!("Discarding corrupted {}: {}", key, reason);
      if let Err(e) = store.save(key, "[]") {
        warn!("Failed to reset {}: {}", key, e);
      }
      notifier.queue_corrupted(QueueCorrupted {
        storage_key: key.to_string(),
        reason,
      });
      Some(Vec::new())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Cache, TtlTable};
  use crate::clock::ManualClock;
  use crate::db::MemoryStore;
  use crate::error::{Result, SyncError};
  use futures::future::BoxFuture;
  use serde_json::json;
  use std::collections::VecDeque;
  use std::sync::atomic::AtomicU32;

  /// Executor that replays a script of outcomes, then falls back to a default.
  struct ScriptedExecutor {
    calls: AtomicU32,
    script: Mutex<VecDeque<fn() -> SyncError>>,
    default_failure: Option<fn() -> SyncError>,
    delay: Duration,
  }

  impl ScriptedExecutor {
    fn succeeding() -> Self {
      Self {
        calls: AtomicU32::new(0),
        script: Mutex::new(VecDeque::new()),
        default_failure: None,
        delay: Duration::ZERO,
      }
    }

    fn failing(make: fn() -> SyncError) -> Self {
      Self {
        default_failure: Some(make),
        ..Self::succeeding()
      }
    }

    fn then_fail(self, make: fn() -> SyncError) -> Self {
      self.script.lock().unwrap().push_back(make);
      self
    }

    fn calls(&self) -> u32 {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl OperationExecutor for ScriptedExecutor {
    fn execute<'a>(&'a self, _op: &'a QueuedOperation) -> BoxFuture<'a, Result<()>> {
      Box::pin(async move {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
          tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted.or(self.default_failure) {
          Some(make) => Err(make()),
          None => Ok(()),
        }
      })
    }
  }

  fn remote() -> SyncError {
    SyncError::Remote("500 internal error".into())
  }

  fn network() -> SyncError {
    SyncError::Network("connection refused".into())
  }

  fn auth() -> SyncError {
    SyncError::Authentication("session expired".into())
  }

  struct Harness {
    store: Arc<MemoryStore>,
    notifier: Arc<Notifier>,
    connectivity: Arc<ConnectivityMonitor>,
    executor: Arc<ScriptedExecutor>,
  }

  impl Harness {
    fn new(executor: ScriptedExecutor, online: bool) -> Self {
      let notifier = Arc::new(Notifier::new());
      let state = if online {
        Connectivity::Online
      } else {
        Connectivity::Offline
      };
      Self {
        store: Arc::new(MemoryStore::new()),
        connectivity: Arc::new(ConnectivityMonitor::new(state, notifier.clone())),
        notifier,
        executor: Arc::new(executor),
      }
    }

    fn queue(&self) -> OperationQueue {
      OperationQueue::new(
        self.store.clone(),
        self.executor.clone(),
        self.connectivity.clone(),
        self.notifier.clone(),
      )
      .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
    }
  }

  #[tokio::test]
  async fn test_reload_restores_identical_operations() {
    let harness = Harness::new(ScriptedExecutor::succeeding(), false);
    let queue = harness.queue();

    let enqueued = vec![
      queue.enqueue(OperationKind::Create, EntityType::Goal, json!({"id": "g1"})),
      queue.enqueue(OperationKind::Update, EntityType::Note, json!({"id": "n1", "body": "x"})),
      queue.enqueue(OperationKind::Delete, EntityType::Event, json!({"id": "e1"})),
    ];

    let reloaded = harness.queue();
    assert_eq!(reloaded.pending(), enqueued);
    assert_eq!(reloaded.len(), 3);
    assert_eq!(harness.executor.calls(), 0);
  }

  #[tokio::test]
  async fn test_success_removes_operation() {
    let harness = Harness::new(ScriptedExecutor::succeeding(), true);
    let queue = harness.queue();
    queue.enqueue(OperationKind::Create, EntityType::Goal, json!({}));

    let report = queue.process_pending().await;

    assert_eq!(report.succeeded, 1);
    assert!(queue.is_empty());
    assert!(harness.queue().is_empty());
  }

  #[tokio::test]
  async fn test_retry_ceiling_moves_to_failure_list() {
    let harness = Harness::new(ScriptedExecutor::failing(remote), true);
    let mut failures = harness.notifier.subscribe_failures();
    let queue = harness.queue();
    let op1 = queue.enqueue(OperationKind::Update, EntityType::Note, json!({"id": "n1"}));

    assert_eq!(queue.process_pending().await.retried, 1);
    assert_eq!(queue.pending()[0].attempt_count, 1);
    assert_eq!(queue.process_pending().await.retried, 1);
    let report = queue.process_pending().await;
    assert_eq!(report.failed, 1);

    assert!(queue.pending().iter().all(|op| op.id != op1.id));
    let failed = queue.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, op1.id);
    assert_eq!(failed[0].attempt_count, 3);

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.operation.id, op1.id);
    assert!(failure.reason.contains("500"));

    // Further passes never touch it again
    queue.process_pending().await;
    queue.process_pending().await;
    assert_eq!(harness.executor.calls(), 3);

    let reloaded = harness.queue();
    assert!(reloaded.is_empty());
    assert_eq!(reloaded.failed()[0].attempt_count, 3);
  }

  #[tokio::test]
  async fn test_offline_pass_counts_nothing() {
    let harness = Harness::new(ScriptedExecutor::failing(remote), false);
    let queue = harness.queue();
    queue.enqueue(OperationKind::Create, EntityType::Goal, json!({}));

    let report = queue.process_pending().await;

    assert_eq!(report.skipped, Some(SkipReason::Offline));
    assert_eq!(harness.executor.calls(), 0);
    assert_eq!(queue.pending()[0].attempt_count, 0);
  }

  #[tokio::test]
  async fn test_network_failure_is_not_an_attempt() {
    let harness = Harness::new(ScriptedExecutor::succeeding().then_fail(network), true);
    let queue = harness.queue();
    queue.enqueue(OperationKind::Create, EntityType::Goal, json!({}));
    queue.enqueue(OperationKind::Create, EntityType::Goal, json!({}));

    let report = queue.process_pending().await;
    assert!(report.interrupted);
    assert_eq!(harness.executor.calls(), 1);
    assert!(queue.pending().iter().all(|op| op.attempt_count == 0));

    let report = queue.process_pending().await;
    assert_eq!(report.succeeded, 2);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_authentication_failure_pauses_until_resume() {
    let harness = Harness::new(ScriptedExecutor::succeeding().then_fail(auth), true);
    let mut notices = harness.notifier.subscribe_notices();
    let queue = harness.queue();
    queue.enqueue(OperationKind::Update, EntityType::Preference, json!({}));

    queue.process_pending().await;
    assert!(queue.is_paused());
    assert_eq!(queue.pending()[0].attempt_count, 0);
    assert_eq!(notices.recv().await.unwrap().level, NoticeLevel::Error);
    assert_eq!(
      queue.process_pending().await.skipped,
      Some(SkipReason::Paused)
    );

    queue.resume();
    assert_eq!(queue.process_pending().await.succeeded, 1);
  }

  /// Store whose reads can be switched off, as with a locked database.
  struct FlakyStore {
    inner: MemoryStore,
    readable: AtomicBool,
  }

  impl QueueStore for FlakyStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
      if !self.readable.load(Ordering::SeqCst) {
        return Err(SyncError::Storage("database is locked".into()));
      }
      self.inner.load(key)
    }

    fn save(&self, key: &str, data: &str) -> Result<()> {
      self.inner.save(key, data)
    }
  }

  fn stored_ids(store: &dyn QueueStore, key: &str) -> Vec<String> {
    let blob = store.load(key).unwrap().unwrap_or_else(|| "[]".to_string());
    parse_operations(&blob)
      .unwrap()
      .into_iter()
      .map(|op| op.id)
      .collect()
  }

  #[tokio::test]
  async fn test_unreadable_store_is_never_overwritten() {
    let store = Arc::new(FlakyStore {
      inner: MemoryStore::new(),
      readable: AtomicBool::new(true),
    });
    let notifier = Arc::new(Notifier::new());
    let connectivity = Arc::new(ConnectivityMonitor::new(
      Connectivity::Offline,
      notifier.clone(),
    ));
    let open = || {
      OperationQueue::new(
        store.clone(),
        Arc::new(ScriptedExecutor::succeeding()),
        connectivity.clone(),
        notifier.clone(),
      )
    };

    let first = open();
    let g1 = first.enqueue(OperationKind::Create, EntityType::Goal, json!({"id": "g1"}));
    let g2 = first.enqueue(OperationKind::Create, EntityType::Goal, json!({"id": "g2"}));

    store.readable.store(false, Ordering::SeqCst);
    let mut notices = notifier.subscribe_notices();
    let mut corruption = notifier.subscribe_corruption();
    let reopened = open();

    assert_eq!(notices.try_recv().unwrap().level, NoticeLevel::Warning);
    assert!(corruption.try_recv().is_err());
    assert!(reopened.is_empty());

    let n1 = reopened.enqueue(OperationKind::Delete, EntityType::Note, json!({"id": "n1"}));
    assert_eq!(
      stored_ids(&store.inner, QUEUE_STORAGE_KEY),
      vec![g1.id.clone(), g2.id.clone()]
    );

    // Once the store answers again, stored and new operations are merged
    store.readable.store(true, Ordering::SeqCst);
    let ids: Vec<String> = reopened.pending().into_iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![g1.id.clone(), g2.id.clone(), n1.id.clone()]);
    assert_eq!(stored_ids(&store.inner, QUEUE_STORAGE_KEY), ids);
    assert_eq!(open().len(), 3);
  }

  #[tokio::test]
  async fn test_supersede_drops_writes_of_that_entity_only() {
    let harness = Harness::new(ScriptedExecutor::succeeding(), false);
    let queue = harness.queue();
    let g1 = EntityKey::new(EntityType::Goal, "g1");
    let g2 = EntityKey::new(EntityType::Goal, "g2");

    queue.enqueue_for(OperationKind::Update, &g1, json!({"title": "v1"}));
    let other = queue.enqueue_for(OperationKind::Update, &g2, json!({}));
    let untargeted = queue.enqueue(OperationKind::Update, EntityType::Goal, json!({}));
    queue.enqueue_for(OperationKind::Update, &g1, json!({"title": "v2"}));
    let mut events = harness.notifier.subscribe_queue();

    assert_eq!(queue.supersede(&g1), 2);

    let ids: Vec<String> = queue.pending().into_iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![other.id, untargeted.id]);
    assert_eq!(harness.queue().len(), 2);
    assert!(matches!(
      events.try_recv().unwrap(),
      QueueEvent::Superseded { pending: 2, .. }
    ));
    assert_eq!(queue.supersede(&g1), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_operation_superseded_mid_pass_is_skipped() {
    let mut executor = ScriptedExecutor::succeeding();
    executor.delay = Duration::from_millis(50);
    let harness = Harness::new(executor, true);
    let queue = Arc::new(harness.queue());
    let g2 = EntityKey::new(EntityType::Goal, "g2");
    queue.enqueue_for(OperationKind::Update, &EntityKey::new(EntityType::Goal, "g1"), json!({}));
    queue.enqueue_for(OperationKind::Update, &g2, json!({}));

    let pass = tokio::spawn({
      let queue = queue.clone();
      async move { queue.process_pending().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.supersede(&g2);
    let report = pass.await.unwrap();

    assert_eq!(report.attempted, 1);
    assert_eq!(harness.executor.calls(), 1);
    assert!(queue.is_empty());
  }

  /// Fails operations flagged in their payload and records the stored live
  /// list while running the others.
  struct InspectingExecutor {
    store: Arc<MemoryStore>,
    seen: Mutex<Vec<Vec<String>>>,
  }

  impl OperationExecutor for InspectingExecutor {
    fn execute<'a>(&'a self, op: &'a QueuedOperation) -> BoxFuture<'a, Result<()>> {
      Box::pin(async move {
        if op.payload["fail"] == true {
          return Err(remote());
        }
        let ids = stored_ids(&*self.store, QUEUE_STORAGE_KEY);
        self.seen.lock().unwrap().push(ids);
        Ok(())
      })
    }
  }

  #[tokio::test]
  async fn test_terminal_failure_leaves_the_stored_live_list_at_once() {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(InspectingExecutor {
      store: store.clone(),
      seen: Mutex::new(Vec::new()),
    });
    let notifier = Arc::new(Notifier::new());
    let queue = OperationQueue::new(
      store.clone(),
      executor.clone(),
      Arc::new(ConnectivityMonitor::new(Connectivity::Online, notifier.clone())),
      notifier,
    )
    .with_options(QueueOptions {
      max_retries: 1,
      ..QueueOptions::default()
    });

    let doomed = queue.enqueue(OperationKind::Update, EntityType::Note, json!({"fail": true}));
    let fine = queue.enqueue(OperationKind::Update, EntityType::Note, json!({}));

    let report = queue.process_pending().await;

    assert_eq!((report.failed, report.succeeded), (1, 1));
    // While the second operation ran, the failed one was already gone from
    // the stored live list and present in the stored failure list
    assert_eq!(*executor.seen.lock().unwrap(), vec![vec![fine.id.clone()]]);
    assert_eq!(stored_ids(&*store, FAILED_STORAGE_KEY), vec![doomed.id]);
  }

  #[tokio::test]
  async fn test_corrupted_blob_resets_queue() {
    for blob in [
      "{definitely not json",
      r#"{"id": "op1"}"#,
      r#"[{"id": "ok", "kind": "create", "entityType": "goal", "payload": {}, "enqueuedAt": 1, "attemptCount": 0},
          {"id": "bad", "kind": "create", "payload": {}, "enqueuedAt": 1, "attemptCount": 0}]"#,
    ] {
      let harness = Harness::new(ScriptedExecutor::succeeding(), false);
      harness.store.save(QUEUE_STORAGE_KEY, blob).unwrap();
      let mut corruption = harness.notifier.subscribe_corruption();

      let queue = harness.queue();

      assert!(queue.is_empty(), "blob should be rejected whole: {}", blob);
      let event = corruption.try_recv().unwrap();
      assert_eq!(event.storage_key, QUEUE_STORAGE_KEY);
      assert_eq!(
        harness.store.load(QUEUE_STORAGE_KEY).unwrap().as_deref(),
        Some("[]")
      );
    }
  }

  #[tokio::test]
  async fn test_corrupted_failure_list_leaves_live_queue_alone() {
    let harness = Harness::new(ScriptedExecutor::succeeding(), false);
    harness.queue().enqueue(OperationKind::Create, EntityType::Goal, json!({}));
    harness.store.save(FAILED_STORAGE_KEY, "42").unwrap();

    let queue = harness.queue();
    assert_eq!(queue.len(), 1);
    assert!(queue.failed().is_empty());
  }

  #[tokio::test]
  async fn test_manual_retry_and_discard() {
    let harness = Harness::new(ScriptedExecutor::failing(remote), true);
    let queue = harness
      .queue()
      .with_options(QueueOptions {
        max_retries: 1,
        ..QueueOptions::default()
      });
    let a = queue.enqueue(OperationKind::Create, EntityType::Review, json!({}));
    let b = queue.enqueue(OperationKind::Create, EntityType::Review, json!({}));
    queue.process_pending().await;
    assert_eq!(queue.failed().len(), 2);

    assert!(queue.retry_failed(&a.id));
    assert!(!queue.retry_failed("missing"));
    assert_eq!(queue.pending()[0].id, a.id);
    assert_eq!(queue.pending()[0].attempt_count, 0);

    let discarded = queue.discard_failed(&b.id).unwrap();
    assert_eq!(discarded.id, b.id);
    assert!(queue.discard_failed(&b.id).is_none());

    let reloaded = harness.queue();
    assert_eq!(reloaded.len(), 1);
    assert!(reloaded.failed().is_empty());
  }

  #[tokio::test]
  async fn test_retry_all_and_clear_failed() {
    let harness = Harness::new(ScriptedExecutor::failing(remote), true);
    let queue = harness.queue().with_options(QueueOptions {
      max_retries: 1,
      ..QueueOptions::default()
    });
    for _ in 0..3 {
      queue.enqueue(OperationKind::Delete, EntityType::Note, json!({}));
    }
    queue.process_pending().await;
    assert_eq!(queue.retry_all_failed(), 3);
    assert_eq!(queue.len(), 3);

    queue.process_pending().await;
    assert_eq!(queue.clear_failed(), 3);
    assert!(queue.failed().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_overlapping_pass_is_a_noop() {
    let mut executor = ScriptedExecutor::succeeding();
    executor.delay = Duration::from_millis(50);
    let harness = Harness::new(executor, true);
    let queue = harness.queue();
    queue.enqueue(OperationKind::Create, EntityType::Goal, json!({}));

    let (first, second) = tokio::join!(queue.process_pending(), queue.process_pending());

    assert_eq!(first.succeeded, 1);
    assert_eq!(second.skipped, Some(SkipReason::AlreadyRunning));
    assert_eq!(harness.executor.calls(), 1);
  }

  #[tokio::test]
  async fn test_settled_operation_invalidates_cache() {
    let harness = Harness::new(ScriptedExecutor::succeeding(), true);
    let queue = harness.queue();
    let cache = Arc::new(Cache::new(Arc::new(SystemClock)));
    let scope = CacheScope::new(cache, "alice", Arc::new(TtlTable::default()));
    scope.set("goal:list", &vec![1], Duration::from_secs(60)).unwrap();
    scope.set("note:list", &vec![2], Duration::from_secs(60)).unwrap();
    queue.set_cache_scope(Some(scope.clone()));

    queue.enqueue(OperationKind::Update, EntityType::Goal, json!({}));
    queue.process_pending().await;

    assert_eq!(scope.get::<Vec<i32>>("goal:list"), None);
    assert_eq!(scope.get::<Vec<i32>>("note:list"), Some(vec![2]));
  }

  struct RefusingBackgroundSync;

  impl BackgroundSync for RefusingBackgroundSync {
    fn register(&self, _tag: &str) -> Result<()> {
      Err(SyncError::Storage("permission denied".into()))
    }
  }

  #[tokio::test]
  async fn test_background_sync_is_optional() {
    let harness = Harness::new(ScriptedExecutor::succeeding(), false);
    let queue = harness.queue();
    assert_eq!(
      queue.register_background_sync(),
      BackgroundSyncStatus::Unavailable
    );

    let queue = queue.with_background_sync(Some(Arc::new(RefusingBackgroundSync)));
    assert!(matches!(
      queue.register_background_sync(),
      BackgroundSyncStatus::Failed(_)
    ));
    queue.enqueue(OperationKind::Create, EntityType::Goal, json!({}));
    assert_eq!(queue.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_worker_flushes_on_connectivity_restore() {
    let harness = Harness::new(ScriptedExecutor::succeeding(), false);
    let queue = Arc::new(harness.queue());
    let mut events = harness.notifier.subscribe_queue();
    queue.enqueue(OperationKind::Create, EntityType::Goal, json!({}));
    assert!(matches!(events.recv().await.unwrap(), QueueEvent::Enqueued { .. }));

    let worker = queue.spawn_worker();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.len(), 1);

    harness.connectivity.set_online(true);
    assert!(matches!(
      events.recv().await.unwrap(),
      QueueEvent::Succeeded { pending: 0, .. }
    ));
    assert!(queue.is_empty());

    queue.enqueue(OperationKind::Update, EntityType::Goal, json!({}));
    assert!(matches!(events.recv().await.unwrap(), QueueEvent::Enqueued { .. }));
    assert!(matches!(
      events.recv().await.unwrap(),
      QueueEvent::Succeeded { .. }
    ));

    worker.abort();
  }
}
