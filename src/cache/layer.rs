//! Owner-scoped cache view with read-through fetching.

use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::storage::Cache;
use super::traits::{CacheResult, TtlTable};
use crate::entity::EntityType;
use crate::error::{Result, SyncError};

/// Stable key prefix for one owner identity.
///
/// Scope is derived only from who owns the data, so two signed-in identities
/// never share an entry for the same resource name.
pub fn owner_prefix(owner: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(owner.as_bytes());
  let digest = hex::encode(hasher.finalize());
  digest[..16].to_string()
}

/// View of the shared [`Cache`] restricted to one owner.
///
/// Resource names start with the entity type tag (`goal:list:2026`,
/// `preference`), which lets a write to one entity type invalidate exactly
/// that type's entries.
#[derive(Clone)]
pub struct CacheScope {
  cache: Arc<Cache>,
  prefix: String,
  ttl: Arc<TtlTable>,
}

impl CacheScope {
  pub fn new(cache: Arc<Cache>, owner: &str, ttl: Arc<TtlTable>) -> Self {
    Self {
      cache,
      prefix: owner_prefix(owner),
      ttl,
    }
  }

  pub fn ttl(&self) -> &TtlTable {
    &self.ttl
  }

  /// Full cache key for a resource name.
  pub fn key(&self, resource: &str) -> String {
    format!("{}:{}", self.prefix, resource)
  }

  pub fn get<T: DeserializeOwned>(&self, resource: &str) -> Option<T> {
    self.cache.get(&self.key(resource))
  }

  pub fn set<T: Serialize>(&self, resource: &str, value: &T, ttl: Duration) -> Result<()> {
    self.cache.set(&self.key(resource), value, ttl)
  }

  /// Store using the TTL row of the resource's entity type.
  pub fn set_for<T: Serialize>(
    &self,
    entity_type: &EntityType,
    resource: &str,
    value: &T,
  ) -> Result<()> {
    self.set(resource, value, self.ttl.for_entity(entity_type))
  }

  /// Drop every entry of this owner whose resource belongs to `entity_type`.
  pub fn invalidate_entity_type(&self, entity_type: &EntityType) -> usize {
    let pattern = format!(
      "^{}:{}(:|$)",
      regex::escape(&self.prefix),
      regex::escape(entity_type.as_str())
    );
    self.invalidate_pattern(&pattern)
  }

  /// Drop everything cached for this owner (sign-out).
  pub fn invalidate_owner(&self) -> usize {
    let pattern = format!("^{}:", regex::escape(&self.prefix));
    self.invalidate_pattern(&pattern)
  }

  fn invalidate_pattern(&self, pattern: &str) -> usize {
    match Regex::new(pattern) {
      Ok(re) => self.cache.invalidate_matching(&re),
      Err(e) => {
        // Both inputs are escaped, so this is unreachable in practice.
        warn!("Invalid cache invalidation pattern {}: {}", pattern, e);
        0
      }
    }
  }

  /// Read-through fetch.
  ///
  /// 1. Unexpired entry - return it
  /// 2. Otherwise fetch and store the result with `ttl`
  /// 3. If the fetch fails with a network error and an (expired) value is
  ///    still around, serve it as offline data
  pub async fn fetch<T, F, Fut>(
    &self,
    resource: &str,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let key = self.key(resource);
    let stale = match self.cache.peek::<T>(&key) {
      Some((data, true)) => return Ok(CacheResult::from_cache(data)),
      Some((data, false)) => Some(data),
      None => None,
    };

    match fetcher().await {
      Ok(data) => {
        self.cache.set(&key, &data, ttl)?;
        Ok(CacheResult::from_network(data))
      }
      Err(SyncError::Network(reason)) => match stale {
        Some(data) => {
          debug!("Serving {} from cache while offline: {}", resource, reason);
          Ok(CacheResult::offline(data))
        }
        None => Err(SyncError::Network(reason)),
      },
      Err(e) => Err(e),
    }
  }
}
