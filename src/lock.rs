//! FIFO async mutual exclusion for save and sync passes.
//!
//! The lock keeps an explicit queue of waiters plus a single "held" flag.
//! Releasing hands the lock directly to the oldest live waiter, so a later
//! arrival can never overtake an earlier one.
//!
//! There is no re-entrancy: a holder that calls [`AsyncMutex::acquire`] again
//! before releasing waits on itself forever.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard as StdGuard};
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Default)]
struct LockState {
  held: bool,
  waiters: VecDeque<oneshot::Sender<()>>,
}

/// Async mutex with strict arrival-order fairness.
#[derive(Debug)]
pub struct AsyncMutex {
  name: &'static str,
  state: Mutex<LockState>,
}

impl AsyncMutex {
  pub fn new(name: &'static str) -> Self {
    Self {
      name,
      state: Mutex::new(LockState::default()),
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  fn state(&self) -> StdGuard<'_, LockState> {
    // The state is two plain fields that are never left half-written.
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Wait until the lock is free and take it. Waiters are served in arrival order.
  pub async fn acquire(&self) -> MutexGuard<'_> {
    self.wait_turn().await;
    MutexGuard { mutex: self }
  }

  /// Like [`acquire`](Self::acquire), but the guard owns a handle to the lock
  /// and can be moved into spawned tasks.
  pub async fn acquire_owned(self: Arc<Self>) -> OwnedMutexGuard {
    self.wait_turn().await;
    OwnedMutexGuard { mutex: self }
  }

  /// Take the lock only if nobody holds it right now.
  pub fn try_acquire(&self) -> Option<MutexGuard<'_>> {
    let mut state = self.state();
    if state.held {
      return None;
    }
    state.held = true;
    Some(MutexGuard { mutex: self })
  }

  /// Run `f` while holding the lock. The lock is released on every exit path,
  /// including an `Err` result or a panic inside `f`.
  pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    let _guard = self.acquire().await;
    f().await
  }

  pub fn is_locked(&self) -> bool {
    self.state().held
  }

  /// Number of callers currently queued behind the holder.
  pub fn waiting(&self) -> usize {
    self.state().waiters.iter().filter(|w| !w.is_closed()).count()
  }

  async fn wait_turn(&self) {
    loop {
      let rx = {
        let mut state = self.state();
        if !state.held {
          state.held = true;
          return;
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        trace!(lock = self.name, queued = state.waiters.len(), "waiting for lock");
        rx
      };

      let mut pending = PendingTurn {
        mutex: self,
        rx,
        settled: false,
      };
      let granted = (&mut pending.rx).await.is_ok();
      pending.settled = true;
      if granted {
        return;
      }
    }
  }

  fn release(&self) {
    let mut state = self.state();
    while let Some(next) = state.waiters.pop_front() {
      // A failed send means that waiter gave up; try the next one.
      if next.send(()).is_ok() {
        trace!(lock = self.name, "lock handed to next waiter");
        return;
      }
    }
    state.held = false;
  }
}

/// A queued acquire that may be dropped before it completes.
struct PendingTurn<'a> {
  mutex: &'a AsyncMutex,
  rx: oneshot::Receiver<()>,
  settled: bool,
}

impl Drop for PendingTurn<'_> {
  fn drop(&mut self) {
    if self.settled {
      return;
    }
    self.rx.close();
    // The lock may have been handed over right before cancellation.
    if self.rx.try_recv().is_ok() {
      self.mutex.release();
    }
  }
}

/// Release capability for a borrowed [`AsyncMutex`]. Dropping it releases the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct MutexGuard<'a> {
  mutex: &'a AsyncMutex,
}

impl MutexGuard<'_> {
  pub fn release(self) {
    drop(self);
  }
}

impl Drop for MutexGuard<'_> {
  fn drop(&mut self) {
    self.mutex.release();
  }
}

/// Release capability that keeps the [`AsyncMutex`] alive on its own.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct OwnedMutexGuard {
  mutex: Arc<AsyncMutex>,
}

impl OwnedMutexGuard {
  pub fn release(self) {
    drop(self);
  }
}

impl Drop for OwnedMutexGuard {
  fn drop(&mut self) {
    self.mutex.release();
  }
}

/// The two shared lock instances of the sync layer.
///
/// `sync` serializes cross-device sync passes, `batch_save` serializes
/// flushes of locally dirty entities. They protect disjoint concerns and give
/// no ordering guarantee relative to each other.
#[derive(Debug, Clone)]
pub struct SyncLocks {
  pub sync: Arc<AsyncMutex>,
  pub batch_save: Arc<AsyncMutex>,
}

impl Default for SyncLocks {
  fn default() -> Self {
    Self::new()
  }
}

impl SyncLocks {
  pub fn new() -> Self {
    Self {
      sync: Arc::new(AsyncMutex::new("sync")),
      batch_save: Arc::new(AsyncMutex::new("batch_save")),
    }
  }
}
