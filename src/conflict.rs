//! Last-write-wins conflict detection on whole-entity timestamps.
//!
//! The detector only observes. Call sites on the remote write path decide
//! what to do with a [`ConflictRecord`]; the detector records it in a bounded
//! history and broadcasts it so the user can be told.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::warn;

use crate::entity::EntityType;
use crate::event::Notifier;

/// Two timestamps closer than this are treated as simultaneous.
pub const CLOCK_SKEW_TOLERANCE_MS: i64 = 1000;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
  LocalWins,
  RemoteWins,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
  pub entity_type: EntityType,
  pub entity_id: String,
  pub entity_label: Option<String>,
  pub local_modified_at: i64,
  pub remote_modified_at: i64,
  pub resolution: Resolution,
}

impl ConflictRecord {
  /// Human-readable summary for notices.
  pub fn describe(&self) -> String {
    let what = match &self.entity_label {
      Some(label) => format!("{} \"{}\"", self.entity_type, label),
      None => format!("{} {}", self.entity_type, self.entity_id),
    };
    let gap_secs = (self.remote_modified_at - self.local_modified_at).abs() / 1000;
    match self.resolution {
      Resolution::RemoteWins => format!(
        "{} was changed on another device {}s after your copy",
        what, gap_secs
      ),
      Resolution::LocalWins => format!("Your change to {} is newer and was kept", what),
    }
  }
}

/// `true` only when the remote copy is newer than the local one by more
/// than `tolerance_ms`. Missing timestamps never conflict.
pub fn has_conflict_within(local: Option<i64>, remote: Option<i64>, tolerance_ms: i64) -> bool {
  match (local, remote) {
    (Some(local), Some(remote)) => remote.saturating_sub(local) > tolerance_ms,
    _ => false,
  }
}

/// [`has_conflict_within`] with the standard clock-skew tolerance.
pub fn has_conflict(local: Option<i64>, remote: Option<i64>) -> bool {
  has_conflict_within(local, remote, CLOCK_SKEW_TOLERANCE_MS)
}

pub struct ConflictDetector {
  tolerance_ms: i64,
  capacity: usize,
  tracked: HashSet<EntityType>,
  history: Mutex<VecDeque<ConflictRecord>>,
  notifier: Arc<Notifier>,
}

impl ConflictDetector {
  pub fn new(notifier: Arc<Notifier>) -> Self {
    Self {
      tolerance_ms: CLOCK_SKEW_TOLERANCE_MS,
      capacity: DEFAULT_HISTORY_CAPACITY,
      tracked: HashSet::from([EntityType::Event]),
      history: Mutex::new(VecDeque::new()),
      notifier,
    }
  }

  pub fn with_tolerance_ms(mut self, tolerance_ms: i64) -> Self {
    self.tolerance_ms = tolerance_ms;
    self
  }

  pub fn with_history_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  /// Entity types whose write path runs conflict checks.
  pub fn with_tracked_types(mut self, types: impl IntoIterator<Item = EntityType>) -> Self {
    self.tracked = types.into_iter().collect();
    self
  }

  pub fn is_tracked(&self, entity_type: &EntityType) -> bool {
    self.tracked.contains(entity_type)
  }

  fn history_lock(&self) -> MutexGuard<'_, VecDeque<ConflictRecord>> {
    self.history.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn has_conflict(&self, local: Option<i64>, remote: Option<i64>) -> bool {
    has_conflict_within(local, remote, self.tolerance_ms)
  }

  /// Compare timestamps for one entity. Every conflict found is recorded and
  /// broadcast before it is returned.
  pub fn detect_conflict(
    &self,
    entity_type: EntityType,
    entity_id: &str,
    local: Option<i64>,
    remote: Option<i64>,
    label: Option<&str>,
  ) -> Option<ConflictRecord> {
    if !self.has_conflict(local, remote) {
      return None;
    }
    let (local, remote) = (local?, remote?);

    let record = ConflictRecord {
      entity_type,
      entity_id: entity_id.to_string(),
      entity_label: label.map(String::from),
      local_modified_at: local,
      remote_modified_at: remote,
      resolution: if local > remote {
        Resolution::LocalWins
      } else {
        Resolution::RemoteWins
      },
    };

    warn!(
      entity = %record.entity_type,
      id = %record.entity_id,
      local,
      remote,
      "Conflict detected"
    );

    {
      let mut history = self.history_lock();
      history.push_back(record.clone());
      while history.len() > self.capacity {
        history.pop_front();
      }
    }
    self.notifier.conflict(record.clone());

    Some(record)
  }

  /// Conflict check for the remote write path; a no-op for untracked types.
  pub fn check_write(
    &self,
    entity_type: EntityType,
    entity_id: &str,
    local: Option<i64>,
    remote: Option<i64>,
    label: Option<&str>,
  ) -> Option<ConflictRecord> {
    if !self.is_tracked(&entity_type) {
      return None;
    }
    self.detect_conflict(entity_type, entity_id, local, remote, label)
  }

  /// Recent conflicts, oldest first.
  pub fn history(&self) -> Vec<ConflictRecord> {
    self.history_lock().iter().cloned().collect()
  }

  pub fn clear_history(&self) {
    self.history_lock().clear();
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ConflictRecord> {
    self.notifier.subscribe_conflicts()
  }
}
