//! In-memory entry store with per-entry expiry and regex invalidation.

use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;

#[derive(Debug, Clone)]
struct CacheEntry {
  value: Value,
  expires_at: i64,
}

/// Key/value cache where every entry carries its own expiry.
///
/// Expiry is lazy: an expired entry is dropped the first time a read sees
/// it. Any caller may read and write without further coordination, since
/// entries are independent and a stale read corrects itself through TTL.
pub struct Cache {
  entries: Mutex<HashMap<String, CacheEntry>>,
  clock: Arc<dyn Clock>,
}

impl Cache {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      clock,
    }
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Raw lookup. Expired and missing keys are both `None`.
  pub fn get_value(&self, key: &str) -> Option<Value> {
    let now = self.clock.now_ms();
    let mut entries = self.entries();
    match entries.get(key) {
      Some(entry) if now <= entry.expires_at => Some(entry.value.clone()),
      Some(_) => {
        entries.remove(key);
        None
      }
      None => None,
    }
  }

  /// Typed lookup. A value that no longer deserializes as `T` is a miss.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let value = self.get_value(key)?;
    match serde_json::from_value(value) {
      Ok(v) => Some(v),
      Err(e) => {
        debug!("Cache entry {} has unexpected shape: {}", key, e);
        None
      }
    }
  }

  /// Last stored value regardless of expiry, with whether it is still fresh.
  /// Never removes anything, so an expired value stays available for offline reads.
  pub(crate) fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<(T, bool)> {
    let now = self.clock.now_ms();
    let (value, fresh) = {
      let entries = self.entries();
      let entry = entries.get(key)?;
      (entry.value.clone(), now <= entry.expires_at)
    };
    serde_json::from_value(value).ok().map(|v| (v, fresh))
  }

  pub fn set_value(&self, key: &str, value: Value, ttl: Duration) {
    let expires_at = self
      .clock
      .now_ms()
      .saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
    self
      .entries()
      .insert(key.to_string(), CacheEntry { value, expires_at });
  }

  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
    let value = serde_json::to_value(value)?;
    self.set_value(key, value, ttl);
    Ok(())
  }

  pub fn remove(&self, key: &str) -> bool {
    self.entries().remove(key).is_some()
  }

  /// Remove every key matching `pattern`. Returns how many keys were removed.
  pub fn invalidate(&self, pattern: &str) -> std::result::Result<usize, regex::Error> {
    let re = Regex::new(pattern)?;
    Ok(self.invalidate_matching(&re))
  }

  pub fn invalidate_matching(&self, re: &Regex) -> usize {
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|key, _| !re.is_match(key));
    let removed = before - entries.len();
    if removed > 0 {
      debug!("Invalidated {} cache entries matching {}", removed, re);
    }
    removed
  }

  /// Drop every expired entry. Reads already ignore them; this just frees memory.
  pub fn purge_expired(&self) -> usize {
    let now = self.clock.now_ms();
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|_, entry| now <= entry.expires_at);
    before - entries.len()
  }

  pub fn clear(&self) {
    self.entries().clear();
  }

  /// Number of stored entries, expired ones included until they are purged.
  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
