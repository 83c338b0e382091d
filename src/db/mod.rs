//! Durable key/value storage for persisted sync state.

pub mod schema;

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, SyncError};

/// Storage backend for named blobs.
pub trait QueueStore: Send + Sync {
  /// Read a blob. A key that was never written is `Ok(None)`.
  fn load(&self, key: &str) -> Result<Option<String>>;

  /// Replace a blob.
  fn save(&self, key: &str, data: &str) -> Result<()>;
}

/// SQLite-backed store, one row per key.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the database at the default location
  pub fn open_default() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::Storage(format!("Failed to create database directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::Storage(format!("Failed to open database at {}: {}", path.display(), e))
    })?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  pub fn open_in_memory() -> Result<Self> {
    let store = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("plansync").join("sync.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| SyncError::Storage(format!("Failed to run migrations: {}", e)))?;
    Ok(())
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl QueueStore for SqliteStore {
  fn load(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    let data = conn
      .query_row(
        "SELECT data FROM sync_blobs WHERE storage_key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(data)
  }

  fn save(&self, key: &str, data: &str) -> Result<()> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO sync_blobs (storage_key, data, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, data],
    )?;
    Ok(())
  }
}

/// Store that lives only as long as the process. Used in tests and when no
/// database is configured.
#[derive(Default)]
pub struct MemoryStore {
  blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl QueueStore for MemoryStore {
  fn load(&self, key: &str) -> Result<Option<String>> {
    let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
    Ok(blobs.get(key).cloned())
  }

  fn save(&self, key: &str, data: &str) -> Result<()> {
    let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
    blobs.insert(key.to_string(), data.to_string());
    Ok(())
  }
}
