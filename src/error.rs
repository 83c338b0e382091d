use thiserror::Error;

/// Errors produced by the sync layer.
///
/// The variant decides how the operation queue treats a failed attempt:
/// network and authentication failures never count against the retry budget.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("not authenticated: {0}")]
  Authentication(String),

  #[error("remote rejected the write: {0}")]
  Remote(String),

  #[error("network unavailable: {0}")]
  Network(String),

  #[error("storage error: {0}")]
  Storage(String),

  #[error("persisted state is corrupted: {0}")]
  Corrupted(String),

  #[error("no executor registered for {kind} {entity_type}")]
  NoExecutor { entity_type: String, kind: String },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
}

impl SyncError {
  pub fn is_network(&self) -> bool {
    matches!(self, SyncError::Network(_))
  }

  pub fn is_authentication(&self) -> bool {
    matches!(self, SyncError::Authentication(_))
  }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
