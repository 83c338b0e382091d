//! The remote write function the queue replays operations through.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;

use super::operation::{OperationKind, QueuedOperation};
use crate::entity::EntityType;
use crate::error::{Result, SyncError};

/// Performs the actual remote write or delete for one operation.
///
/// The queue only looks at the outcome. Timeouts are the executor's job:
/// an in-flight call is never cancelled by the queue.
pub trait OperationExecutor: Send + Sync {
  fn execute<'a>(&'a self, op: &'a QueuedOperation) -> BoxFuture<'a, Result<()>>;
}

/// A boxed handler for one (entity type, kind) pair
type Handler = Box<dyn Fn(QueuedOperation) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Executor that dispatches on `(entity_type, kind)`.
///
/// # Example
///
/// ```ignore
/// let executor = ExecutorRegistry::new()
///   .register(EntityType::Goal, OperationKind::Update, move |op| {
///     let api = api.clone();
///     async move { api.upsert_goal(op.payload).await }
///   });
/// ```
#[derive(Default)]
pub struct ExecutorRegistry {
  handlers: HashMap<(EntityType, OperationKind), Handler>,
}

impl ExecutorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<F, Fut>(mut self, entity_type: EntityType, kind: OperationKind, handler: F) -> Self
  where
    F: Fn(QueuedOperation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    self
      .handlers
      .insert((entity_type, kind), Box::new(move |op| Box::pin(handler(op))));
    self
  }

  pub fn handles(&self, entity_type: &EntityType, kind: OperationKind) -> bool {
    self.handlers.contains_key(&(entity_type.clone(), kind))
  }
}

impl OperationExecutor for ExecutorRegistry {
  fn execute<'a>(&'a self, op: &'a QueuedOperation) -> BoxFuture<'a, Result<()>> {
    match self.handlers.get(&(op.entity_type.clone(), op.kind)) {
      Some(handler) => handler(op.clone()),
      None => {
        let err = SyncError::NoExecutor {
          entity_type: op.entity_type.to_string(),
          kind: op.kind.to_string(),
        };
        Box::pin(async move { Err(err) })
      }
    }
  }
}
