//! Queued operation records and strict validation of persisted blobs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::entity::{EntityKey, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OperationKind::Create => write!(f, "create"),
      OperationKind::Update => write!(f, "update"),
      OperationKind::Delete => write!(f, "delete"),
    }
  }
}

/// One pending remote mutation.
///
/// `attempt_count` only ever grows while the operation is live. It is reset to
/// zero only when an operator moves a terminal failure back into service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
  pub id: String,
  pub kind: OperationKind,
  pub entity_type: EntityType,
  /// Set when the operation writes one known entity, so a later confirmed
  /// save of that entity can supersede it
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entity_id: Option<String>,
  #[serde(default)]
  pub payload: Value,
  /// Epoch milliseconds
  pub enqueued_at: i64,
  pub attempt_count: u32,
}

impl QueuedOperation {
  pub fn targets(&self, key: &EntityKey) -> bool {
    self.entity_type == key.entity_type && self.entity_id.as_deref() == Some(key.id.as_str())
  }
}

/// Parse a persisted queue blob.
///
/// Fails closed: the blob must be a JSON array and every element must carry
/// a string `id` and `entityType`, a known `kind`, and numeric `enqueuedAt`
/// and `attemptCount`. One bad element rejects the whole blob.
pub fn parse_operations(blob: &str) -> Result<Vec<QueuedOperation>, String> {
  let value: Value = serde_json::from_str(blob).map_err(|e| format!("malformed JSON: {}", e))?;

  let Value::Array(items) = value else {
    return Err("persisted queue is not a JSON array".to_string());
  };

  items
    .into_iter()
    .enumerate()
    .map(|(index, item)| {
      serde_json::from_value::<QueuedOperation>(item)
        .map_err(|e| format!("entry {} is invalid: {}", index, e))
    })
    .collect()
}
