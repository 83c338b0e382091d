//! Bookkeeping for entities with unconfirmed local changes.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, SystemClock};
use crate::entity::EntityKey;

/// Latest local state of one dirty entity.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyEntry {
  pub key: EntityKey,
  pub payload: Value,
  /// Bumped on every mark; a save only clears the revision it carried
  pub revision: u64,
  /// Epoch milliseconds of the most recent mark
  pub marked_at: i64,
}

#[derive(Debug, Default)]
struct DirtyState {
  entries: BTreeMap<EntityKey, DirtyEntry>,
  next_revision: u64,
}

/// Set of dirty entities keyed by [`EntityKey`].
///
/// Marking is idempotent: an entity is present at most once, and re-marking
/// only refreshes its payload and revision. Entries leave the set only
/// through [`DirtyTracker::confirm`] with the revision that was written.
pub struct DirtyTracker {
  state: Mutex<DirtyState>,
  clock: Arc<dyn Clock>,
}

impl Default for DirtyTracker {
  fn default() -> Self {
    Self::new(Arc::new(SystemClock))
  }
}

impl DirtyTracker {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self {
      state: Mutex::new(DirtyState::default()),
      clock,
    }
  }

  fn state(&self) -> MutexGuard<'_, DirtyState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Record a local change. Returns `true` if the entity was not dirty before.
  pub fn mark_dirty(&self, key: EntityKey, payload: Value) -> bool {
    let marked_at = self.clock.now_ms();
    let mut state = self.state();
    state.next_revision += 1;
    let revision = state.next_revision;
    let entry = DirtyEntry {
      key: key.clone(),
      payload,
      revision,
      marked_at,
    };
    state.entries.insert(key, entry).is_none()
  }

  pub fn is_dirty(&self, key: &EntityKey) -> bool {
    self.state().entries.contains_key(key)
  }

  /// Current dirty entries, ordered by key.
  pub fn snapshot(&self) -> Vec<DirtyEntry> {
    self.state().entries.values().cloned().collect()
  }

  pub fn keys(&self) -> Vec<EntityKey> {
    self.state().entries.keys().cloned().collect()
  }

  /// Clear an entity after its write was confirmed. If it was marked again
  /// after `revision` was read, the newer change stays dirty.
  pub fn confirm(&self, key: &EntityKey, revision: u64) -> bool {
    let mut state = self.state();
    match state.entries.get(key) {
      Some(entry) if entry.revision == revision => {
        state.entries.remove(key);
        true
      }
      _ => false,
    }
  }

  /// Forget an entity regardless of revision (local delete, sign-out).
  pub fn forget(&self, key: &EntityKey) -> bool {
    self.state().entries.remove(key).is_some()
  }

  pub fn len(&self) -> usize {
    self.state().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state().entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entity::EntityType;
  use serde_json::json;

  fn goal(id: &str) -> EntityKey {
    EntityKey::new(EntityType::Goal, id)
  }

  #[test]
  fn test_marking_twice_keeps_one_entry() {
    let tracker = DirtyTracker::default();
    assert!(tracker.mark_dirty(goal("g1"), json!({"title": "a"})));
    assert!(!tracker.mark_dirty(goal("g1"), json!({"title": "b"})));

    assert_eq!(tracker.len(), 1);
    assert_eq!(tracker.keys(), vec![goal("g1")]);
    assert_eq!(tracker.snapshot()[0].payload, json!({"title": "b"}));
  }

  #[test]
  fn test_same_id_different_type_is_distinct() {
    let tracker = DirtyTracker::default();
    tracker.mark_dirty(goal("x"), json!({}));
    tracker.mark_dirty(EntityKey::new(EntityType::Note, "x"), json!({}));
    assert_eq!(tracker.len(), 2);
  }

  #[test]
  fn test_confirm_requires_matching_revision() {
    let tracker = DirtyTracker::default();
    tracker.mark_dirty(goal("g1"), json!({"v": 1}));
    let saved = tracker.snapshot()[0].revision;

    // edited again while the save was in flight
    tracker.mark_dirty(goal("g1"), json!({"v": 2}));
    assert!(!tracker.confirm(&goal("g1"), saved));
    assert!(tracker.is_dirty(&goal("g1")));

    let latest = tracker.snapshot()[0].revision;
    assert!(tracker.confirm(&goal("g1"), latest));
    assert!(tracker.is_empty());
  }

  #[test]
  fn test_forget() {
    let tracker = DirtyTracker::default();
    tracker.mark_dirty(goal("g1"), json!({}));
    assert!(tracker.forget(&goal("g1")));
    assert!(!tracker.forget(&goal("g1")));
  }
}
