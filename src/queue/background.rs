//! Optional platform background-sync capability.

use crate::error::Result;

/// Platform facility that can wake the app to flush the queue while it is
/// not in the foreground.
pub trait BackgroundSync: Send + Sync {
  fn register(&self, tag: &str) -> Result<()>;
}

/// Outcome of asking the platform for background sync. None of these are
/// errors: retries still happen on the foreground triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundSyncStatus {
  Registered,
  /// No background-sync capability on this platform
  Unavailable,
  Failed(String),
}
