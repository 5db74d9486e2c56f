//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CacheRequest, CachedResponse};
use crate::db::schema::CACHE_SCHEMA;
use crate::db::Database;

/// A stored response and when it was fetched.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: CachedResponse,
  pub fetched_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Entries live in named generations (`static-v3`, `dynamic-v3`, ...).
pub trait CacheStorage: Send + Sync {
  fn get(&self, cache_name: &str, request: &CacheRequest) -> Result<Option<CachedEntry>>;

  /// Insert or overwrite the entry for `request` in `cache_name`.
  fn put(&self, cache_name: &str, request: &CacheRequest, response: &CachedResponse) -> Result<()>;

  fn cache_names(&self) -> Result<Vec<String>>;

  /// Drop a whole generation. Returns the number of entries removed.
  fn delete_cache(&self, cache_name: &str) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - every read goes to the network.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _cache_name: &str, _request: &CacheRequest) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _cache_name: &str, _request: &CacheRequest, _response: &CachedResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_cache(&self, _cache_name: &str) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  pub fn open(path: &Path) -> Result<Self> {
    let db = Database::open(path, CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Ok(Self {
      conn: Mutex::new(db.into_connection()),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, cache_name: &str, request: &CacheRequest) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, fetched_at FROM response_cache
         WHERE cache_name = ? AND request_key = ?",
        params![cache_name, request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body, fetched_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        Ok(Some(CachedEntry {
          response: CachedResponse {
            status,
            headers,
            body,
          },
          fetched_at: parse_datetime(&fetched_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, cache_name: &str, request: &CacheRequest, response: &CachedResponse) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache
           (cache_name, request_key, method, url, status, headers, body, fetched_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          cache_name,
          request.cache_key(),
          request.method.as_str(),
          request.url.as_str(),
          response.status,
          headers,
          response.body,
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM response_cache ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to list caches: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, cache_name: &str) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM response_cache WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
