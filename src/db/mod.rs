pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// Where the substrate lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
  File(PathBuf),
  Memory,
}

/// How the substrate ended up being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
  /// Data survives restarts.
  Persistent,
  /// Storage was denied; data lives only as long as the process.
  MemoryOnly,
}

struct Opened {
  conn: Mutex<Connection>,
  mode: StorageMode,
}

/// Shared handle to the SQLite substrate backing both the cache and the queue.
///
/// Cloning is cheap; all clones see the same connection once `init` succeeds.
#[derive(Clone)]
pub struct Database {
  location: StorageLocation,
  opened: Arc<OnceCell<Opened>>,
}

impl Database {
  pub fn new(location: StorageLocation) -> Self {
    Self {
      location,
      opened: Arc::new(OnceCell::new()),
    }
  }

  /// Database file at `path`, created on `init`.
  pub fn at_path(path: impl Into<PathBuf>) -> Self {
    Self::new(StorageLocation::File(path.into()))
  }

  /// Memory-only database. Nothing survives the process.
  pub fn in_memory() -> Self {
    Self::new(StorageLocation::Memory)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::StorageUnavailable("Could not determine data directory".into()))?;

    Ok(data_dir.join("driftq").join("store.db"))
  }

  pub fn location(&self) -> &StorageLocation {
    &self.location
  }

  /// Open or create the substrate. Calls after the first success are no-ops.
  pub async fn init(&self) -> Result<StorageMode> {
    let opened = self
      .opened
      .get_or_try_init(|| async {
        let (conn, mode) = match &self.location {
          StorageLocation::File(path) => (open_file(path)?, StorageMode::Persistent),
          StorageLocation::Memory => (open_memory()?, StorageMode::MemoryOnly),
        };
        Ok::<_, SyncError>(Opened {
          conn: Mutex::new(conn),
          mode,
        })
      })
      .await?;
    Ok(opened.mode)
  }

  /// Use an in-memory substrate when the configured one could not be opened.
  ///
  /// Returns the mode in effect afterwards; a substrate that was already opened
  /// is left untouched.
  pub async fn init_or_fallback(&self) -> StorageMode {
    match self.init().await {
      Ok(mode) => mode,
      Err(e) => {
        warn!(error = %e, "Persistent storage unavailable, continuing memory-only");
        let opened = self
          .opened
          .get_or_try_init(|| async {
            Ok::<_, SyncError>(Opened {
              conn: Mutex::new(open_memory()?),
              mode: StorageMode::MemoryOnly,
            })
          })
          .await;
        match opened {
          Ok(opened) => opened.mode,
          Err(e) => {
            // Even sqlite's in-memory mode failed; every call will report
            // StorageUnavailable.
            warn!(error = %e, "In-memory storage unavailable");
            StorageMode::MemoryOnly
          }
        }
      }
    }
  }

  pub fn mode(&self) -> Option<StorageMode> {
    self.opened.get().map(|o| o.mode)
  }

  pub fn is_initialized(&self) -> bool {
    self.opened.initialized()
  }

  /// Run `f` against the connection.
  pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let opened = self
      .opened
      .get()
      .ok_or_else(|| SyncError::StorageUnavailable("store has not been initialized".into()))?;
    let mut conn = opened
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))?;
    f(&mut *conn)
  }
}

fn open_file(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(|e| {
      SyncError::StorageUnavailable(format!("Failed to create data directory: {}", e))
    })?;
  }

  let conn = Connection::open(path).map_err(|e| {
    SyncError::StorageUnavailable(format!(
      "Failed to open database at {}: {}",
      path.display(),
      e
    ))
  })?;
  conn
    .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
    .map_err(|e| SyncError::StorageUnavailable(format!("Failed to enable WAL: {}", e)))?;
  run_migrations(&conn)?;
  debug!(path = %path.display(), "Opened persistent store");
  Ok(conn)
}

fn open_memory() -> Result<Connection> {
  let conn = Connection::open_in_memory()
    .map_err(|e| SyncError::StorageUnavailable(format!("Failed to open in-memory store: {}", e)))?;
  run_migrations(&conn)?;
  Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<()> {
  conn
    .execute_batch(schema::SCHEMA)
    .map_err(|e| SyncError::StorageUnavailable(format!("Failed to run migrations: {}", e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_init_is_idempotent() {
    let db = Database::in_memory();
    assert!(!db.is_initialized());
    assert_eq!(db.init().await.unwrap(), StorageMode::MemoryOnly);
    assert_eq!(db.init().await.unwrap(), StorageMode::MemoryOnly);

    let tables: i64 = db
      .with_conn(|conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('cache_entries', 'mutation_queue')",
          [],
          |row| row.get(0),
        )?)
      })
      .unwrap();
    assert_eq!(tables, 2);
  }

  #[test]
  fn test_uninitialized_is_unavailable() {
    let db = Database::in_memory();
    let err = db.with_conn(|_| Ok(())).unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable(_)));
  }

  #[tokio::test]
  async fn test_unopenable_path_falls_back_to_memory() {
    // A path whose parent is a regular file cannot be created.
    let dir = std::env::temp_dir().join(format!("driftq-db-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let blocker = dir.join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let db = Database::at_path(blocker.join("store.db"));
    assert!(matches!(
      db.init().await,
      Err(SyncError::StorageUnavailable(_))
    ));
    assert_eq!(db.init_or_fallback().await, StorageMode::MemoryOnly);
    assert!(db.with_conn(|_| Ok(())).is_ok());

    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn test_file_store_persists_across_handles() {
    let dir = std::env::temp_dir().join(format!("driftq-persist-{}", std::process::id()));
    let path = dir.join("store.db");

    let first = Database::at_path(&path);
    assert_eq!(first.init().await.unwrap(), StorageMode::Persistent);
    first
      .with_conn(|conn| {
        conn.execute(
          "INSERT INTO cache_entries (key, value, stored_at_ms, ttl_seconds) VALUES ('k', x'01', 0, 0)",
          [],
        )?;
        Ok(())
      })
      .unwrap();
    drop(first);

    let second = Database::at_path(&path);
    second.init().await.unwrap();
    let count: i64 = second
      .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?))
      .unwrap();
    assert_eq!(count, 1);

    drop(second);
    std::fs::remove_dir_all(&dir).ok();
  }
}
