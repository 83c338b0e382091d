//! Typed notification channels consumed by the UI layer.
//!
//! Every notification kind gets its own broadcast channel so payload shapes
//! are checked at compile time. Sends are fire-and-forget: having no
//! subscribers is normal and never an error.

use tokio::sync::broadcast;
use tracing::trace;

use crate::conflict::ConflictRecord;
use crate::connectivity::Connectivity;
use crate::queue::QueuedOperation;

const CHANNEL_CAPACITY: usize = 64;

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
  Info,
  Warning,
  Error,
}

/// Generic user-facing message (toast / status bar)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
  pub level: NoticeLevel,
  pub message: String,
}

/// An operation exhausted its retry budget and moved to the failure list.
#[derive(Debug, Clone)]
pub struct TerminalFailure {
  pub operation: QueuedOperation,
  pub reason: String,
}

/// A persisted queue blob failed validation and was reset to empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCorrupted {
  pub storage_key: String,
  pub reason: String,
}

/// Lifecycle changes of queued operations, used for pending-count badges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
  Enqueued { id: String, pending: usize },
  Succeeded { id: String, pending: usize },
  Retrying { id: String, attempt_count: u32 },
  Failed { id: String },
  Requeued { id: String },
  Discarded { id: String },
  /// Dropped because a newer write of the same entity was confirmed
  Superseded { id: String, pending: usize },
}

/// Fan-out hub for all sync notifications.
pub struct Notifier {
  failures: broadcast::Sender<TerminalFailure>,
  corruption: broadcast::Sender<QueueCorrupted>,
  conflicts: broadcast::Sender<ConflictRecord>,
  connectivity: broadcast::Sender<Connectivity>,
  queue: broadcast::Sender<QueueEvent>,
  notices: broadcast::Sender<Notice>,
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}

impl Notifier {
  pub fn new() -> Self {
    Self {
      failures: broadcast::channel(CHANNEL_CAPACITY).0,
      corruption: broadcast::channel(CHANNEL_CAPACITY).0,
      conflicts: broadcast::channel(CHANNEL_CAPACITY).0,
      connectivity: broadcast::channel(CHANNEL_CAPACITY).0,
      queue: broadcast::channel(CHANNEL_CAPACITY).0,
      notices: broadcast::channel(CHANNEL_CAPACITY).0,
    }
  }

  pub fn subscribe_failures(&self) -> broadcast::Receiver<TerminalFailure> {
    self.failures.subscribe()
  }

  pub fn subscribe_corruption(&self) -> broadcast::Receiver<QueueCorrupted> {
    self.corruption.subscribe()
  }

  pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictRecord> {
    self.conflicts.subscribe()
  }

  pub fn subscribe_connectivity(&self) -> broadcast::Receiver<Connectivity> {
    self.connectivity.subscribe()
  }

  pub fn subscribe_queue(&self) -> broadcast::Receiver<QueueEvent> {
    self.queue.subscribe()
  }

  pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
    self.notices.subscribe()
  }

  pub fn terminal_failure(&self, failure: TerminalFailure) {
    let message = format!(
      "{} {} could not be saved after {} attempts and needs attention: {}",
      failure.operation.kind,
      failure.operation.entity_type,
      failure.operation.attempt_count,
      failure.reason
    );
    if self.failures.send(failure).is_err() {
      trace!("no subscribers for terminal failure");
    }
    self.notice(NoticeLevel::Error, message);
  }

  pub fn queue_corrupted(&self, event: QueueCorrupted) {
    let message = format!(
      "Offline changes in '{}' were unreadable and have been reset",
      event.storage_key
    );
    if self.corruption.send(event).is_err() {
      trace!("no subscribers for queue corruption");
    }
    self.notice(NoticeLevel::Warning, message);
  }

  pub fn conflict(&self, record: ConflictRecord) {
    let message = record.describe();
    if self.conflicts.send(record).is_err() {
      trace!("no subscribers for conflict");
    }
    self.notice(NoticeLevel::Warning, message);
  }

  pub fn connectivity(&self, state: Connectivity) {
    if self.connectivity.send(state).is_err() {
      trace!("no subscribers for connectivity change");
    }
  }

  pub fn queue(&self, event: QueueEvent) {
    if self.queue.send(event).is_err() {
      trace!("no subscribers for queue event");
    }
  }

  pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
    let notice = Notice {
      level,
      message: message.into(),
    };
    if self.notices.send(notice).is_err() {
      trace!("no subscribers for notice");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_send_without_subscribers_is_silent() {
    let notifier = Notifier::new();
    notifier.notice(NoticeLevel::Info, "nobody listening");
    notifier.connectivity(Connectivity::Online);
  }

  #[tokio::test]
  async fn test_corruption_also_emits_notice() {
    let notifier = Notifier::new();
    let mut corruption = notifier.subscribe_corruption();
    let mut notices = notifier.subscribe_notices();

    notifier.queue_corrupted(QueueCorrupted {
      storage_key: "sync_queue".to_string(),
      reason: "not an array".to_string(),
    });

    let event = corruption.recv().await.unwrap();
    assert_eq!(event.storage_key, "sync_queue");
    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.level, NoticeLevel::Warning);
    assert!(notice.message.contains("sync_queue"));
  }
}
