//! Result types and the named TTL table for the cache.

use std::time::Duration;

use crate::entity::EntityType;

/// Result from a read-through fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Unexpired cache entry
  Cache,
  /// Network unavailable, serving the last known (possibly expired) value
  Offline,
}

/// Named cache lifetimes. Callers pick a row instead of passing raw numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlTable {
  pub goals: Duration,
  pub events: Duration,
  pub notes: Duration,
  pub preferences: Duration,
  pub achievements: Duration,
  pub reviews: Duration,
  /// Fallback for entity types without a row of their own
  pub default: Duration,
}

impl Default for TtlTable {
  fn default() -> Self {
    Self {
      goals: Duration::from_secs(5 * 60),
      events: Duration::from_secs(2 * 60),
      notes: Duration::from_secs(5 * 60),
      preferences: Duration::from_secs(30 * 60),
      achievements: Duration::from_secs(10 * 60),
      reviews: Duration::from_secs(10 * 60),
      default: Duration::from_secs(60),
    }
  }
}

impl TtlTable {
  pub fn for_entity(&self, entity_type: &EntityType) -> Duration {
    match entity_type {
      EntityType::Goal | EntityType::Intention => self.goals,
      EntityType::Event => self.events,
      EntityType::Note => self.notes,
      EntityType::Preference => self.preferences,
      EntityType::Achievement => self.achievements,
      EntityType::Review => self.reviews,
      EntityType::Other(_) => self.default,
    }
  }
}
