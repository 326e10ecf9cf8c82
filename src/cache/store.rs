//! SQLite-backed key/value cache with per-entry lifetimes.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::entry::{is_expired, CacheEntry};
use crate::clock::{SharedClock, SystemClock};
use crate::db::{Database, StorageMode};
use crate::error::Result;

/// Durable key/value cache.
///
/// Expired entries are never returned: a read that finds one deletes it, and
/// [`CacheStore::clear_expired`] reclaims the ones nobody reads again.
#[derive(Clone)]
pub struct CacheStore {
  db: Database,
  clock: SharedClock,
}

impl CacheStore {
  pub fn new(db: Database) -> Self {
    Self {
      db,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_clock(mut self, clock: SharedClock) -> Self {
    self.clock = clock;
    self
  }

  pub fn database(&self) -> &Database {
    &self.db
  }

  /// Open the underlying store. Safe to call repeatedly.
  pub async fn init(&self) -> Result<StorageMode> {
    self.db.init().await
  }

  /// Look up `key`, returning `None` on a miss or if the entry has expired.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    Ok(self.get_entry(key).await?.map(|entry| entry.value))
  }

  /// Look up `key` along with its metadata.
  pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
    let now_ms = self.clock.now().timestamp_millis();

    let row = self.db.with_conn(|conn| {
      let row: Option<(Vec<u8>, i64, i64)> = conn
        .query_row(
          "SELECT value, stored_at_ms, ttl_seconds FROM cache_entries WHERE key = ?",
          params![key],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

      match row {
        Some((_, stored_at_ms, ttl)) if is_expired(stored_at_ms, ttl as u64, now_ms) => {
          conn.execute("DELETE FROM cache_entries WHERE key = ?", params![key])?;
          debug!(key, "Evicted expired cache entry on read");
          Ok(None)
        }
        other => Ok(other),
      }
    })?;

    let Some((data, stored_at_ms, ttl)) = row else {
      return Ok(None);
    };

    let value: T = serde_json::from_slice(&data)?;
    Ok(Some(CacheEntry {
      key: key.to_string(),
      value,
      stored_at: from_millis(stored_at_ms),
      ttl_seconds: ttl as u64,
    }))
  }

  /// Store `value` under `key`, replacing any previous entry and resetting its age.
  ///
  /// A `ttl_seconds` of zero keeps the entry until it is removed.
  pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_seconds: u64) -> Result<()> {
    // Serialize before touching storage so a bad payload can't disturb other entries.
    let data = serde_json::to_vec(value)?;
    let stored_at_ms = self.clock.now().timestamp_millis();
    let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);

    self.db.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO cache_entries (key, value, stored_at_ms, ttl_seconds)
         VALUES (?, ?, ?, ?)",
        params![key, data, stored_at_ms, ttl],
      )?;
      Ok(())
    })
  }

  /// Delete `key`. Returns whether an entry was removed.
  pub async fn remove(&self, key: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      let removed = conn.execute("DELETE FROM cache_entries WHERE key = ?", params![key])?;
      Ok(removed > 0)
    })
  }

  /// Delete every entry whose lifetime has elapsed, returning how many went.
  pub async fn clear_expired(&self) -> Result<usize> {
    let now_ms = self.clock.now().timestamp_millis();
    let removed = self.db.with_conn(|conn| {
      Ok(conn.execute(
        "DELETE FROM cache_entries
         WHERE ttl_seconds > 0 AND (? - stored_at_ms) > ttl_seconds * 1000",
        params![now_ms],
      )?)
    })?;

    if removed > 0 {
      info!(removed, "Swept expired cache entries");
    }
    Ok(removed)
  }

  /// Number of stored entries, expired ones included until they are swept.
  pub async fn len(&self) -> Result<usize> {
    self.db.with_conn(|conn| {
      let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
      Ok(count as usize)
    })
  }

  pub async fn is_empty(&self) -> Result<bool> {
    Ok(self.len().await? == 0)
  }

  /// Drop every entry, expired or not.
  pub async fn clear(&self) -> Result<usize> {
    self
      .db
      .with_conn(|conn| Ok(conn.execute("DELETE FROM cache_entries", [])?))
  }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
