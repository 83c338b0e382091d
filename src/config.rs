use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::BatchOptions;
use crate::cache::TtlTable;
use crate::conflict::{CLOCK_SKEW_TOLERANCE_MS, DEFAULT_HISTORY_CAPACITY};
use crate::entity::EntityType;
use crate::queue::{QueueOptions, MAX_RETRIES};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// SQLite file for the durable queue (defaults to the data directory)
  pub database_path: Option<PathBuf>,
  pub queue: QueueConfig,
  pub conflict: ConflictConfig,
  pub batch_save: BatchSaveConfig,
  pub cache_ttl: CacheTtlConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub max_retries: u32,
  pub process_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: MAX_RETRIES,
      process_interval_secs: 30,
    }
  }
}

impl QueueConfig {
  pub fn options(&self) -> QueueOptions {
    QueueOptions {
      max_retries: self.max_retries.max(1),
      process_interval: Duration::from_secs(self.process_interval_secs.max(1)),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
  pub tolerance_ms: i64,
  pub history_capacity: usize,
  /// Entity types whose write path checks for conflicts
  pub tracked_entity_types: Vec<EntityType>,
}

impl Default for ConflictConfig {
  fn default() -> Self {
    Self {
      tolerance_ms: CLOCK_SKEW_TOLERANCE_MS,
      history_capacity: DEFAULT_HISTORY_CAPACITY,
      tracked_entity_types: vec![EntityType::Event],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSaveConfig {
  pub interval_secs: u64,
  pub debounce_ms: u64,
}

impl Default for BatchSaveConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      debounce_ms: 1500,
    }
  }
}

impl BatchSaveConfig {
  pub fn options(&self) -> BatchOptions {
    BatchOptions {
      interval: Duration::from_secs(self.interval_secs.max(1)),
      debounce: Duration::from_millis(self.debounce_ms),
    }
  }
}

/// Named cache lifetimes in seconds. Missing rows keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
  pub goals: Option<u64>,
  pub events: Option<u64>,
  pub notes: Option<u64>,
  pub preferences: Option<u64>,
  pub achievements: Option<u64>,
  pub reviews: Option<u64>,
  pub default: Option<u64>,
}

impl CacheTtlConfig {
  pub fn table(&self) -> TtlTable {
    let base = TtlTable::default();
    let pick = |secs: Option<u64>, fallback: Duration| secs.map(Duration::from_secs).unwrap_or(fallback);
    TtlTable {
      goals: pick(self.goals, base.goals),
      events: pick(self.events, base.events),
      notes: pick(self.notes, base.notes),
      preferences: pick(self.preferences, base.preferences),
      achievements: pick(self.achievements, base.achievements),
      reviews: pick(self.reviews, base.reviews),
      default: pick(self.default, base.default),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./plansync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/plansync/config.yaml
  ///
  /// With no file anywhere the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("plansync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("plansync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }
}
