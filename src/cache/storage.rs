//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::key::RequestKey;
use super::types::{CacheGeneration, CachedEntry};
use crate::network::Response;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Register a generation if it does not exist yet.
  fn ensure_generation(&self, generation: &CacheGeneration) -> Result<()>;

  /// Names of all stored generations.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and all of its entries. Returns false if it did not exist.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Store a response, replacing any entry with the same key. Returns false
  /// without writing when the generation does not exist (it was evicted).
  fn put_entry(
    &self,
    generation: &CacheGeneration,
    key: &RequestKey,
    vary: &[(String, Option<String>)],
    response: &Response,
  ) -> Result<bool>;

  /// Candidate entries for a key, most recently stored first.
  fn find_entries(
    &self,
    generation: &str,
    key: &RequestKey,
    ignore_query: bool,
  ) -> Result<Vec<CachedEntry>>;

  fn entry_count(&self, generation: &str) -> Result<usize>;

  /// Names of the auxiliary key-value stores.
  fn aux_stores(&self) -> Result<Vec<String>>;

  fn aux_put(&self, store: &str, key: &str, value: &[u8]) -> Result<()>;

  fn drop_aux_store(&self, store: &str) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    base_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    vary TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_base
    ON cache_entries(generation, base_hash);

-- Key-value stores created by the hosting application
CREATE TABLE IF NOT EXISTS aux_kv (
    store TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (store, key)
);
"#;

impl CacheStorage for SqliteStorage {
  fn ensure_generation(&self, generation: &CacheGeneration) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO cache_generations (name, version) VALUES (?, ?)",
        params![generation.name, generation.version],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", generation.name, e))?;
    Ok(())
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put_entry(
    &self,
    generation: &CacheGeneration,
    key: &RequestKey,
    vary: &[(String, Option<String>)],
    response: &Response,
  ) -> Result<bool> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let vary =
      serde_json::to_string(vary).map_err(|e| eyre!("Failed to serialize vary: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let exists: Option<i64> = tx
      .query_row(
        "SELECT 1 FROM cache_generations WHERE name = ?",
        params![generation.name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up generation {}: {}", generation.name, e))?;
    if exists.is_none() {
      return Ok(false);
    }

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (generation, key_hash, base_hash, method, url, status, headers, body, vary, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation.name,
        key.hash(),
        key.base_hash(),
        key.method,
        key.url,
        response.status,
        headers,
        response.body,
        vary,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry for {}: {}", key.url, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(true)
  }

  fn find_entries(
    &self,
    generation: &str,
    key: &RequestKey,
    ignore_query: bool,
  ) -> Result<Vec<CachedEntry>> {
    let (column, hash) = if ignore_query {
      ("base_hash", key.base_hash())
    } else {
      ("key_hash", key.hash())
    };

    let conn = self.lock()?;
    let sql = format!(
      "SELECT url, status, headers, body, vary, cached_at FROM cache_entries
       WHERE generation = ? AND {} = ?
       ORDER BY rowid DESC",
      column
    );
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![generation, hash], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, u16>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Vec<u8>>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry row: {}", e))?;

    rows
      .into_iter()
      .map(|(url, status, headers, body, vary, cached_at)| {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let vary =
          serde_json::from_str(&vary).map_err(|e| eyre!("Failed to deserialize vary: {}", e))?;
        Ok(CachedEntry {
          url,
          response: Response {
            status,
            headers,
            body,
          },
          vary,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count as usize)
  }

  fn aux_stores(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT store FROM aux_kv ORDER BY store")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let stores = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store row: {}", e))?;

    Ok(stores)
  }

  fn aux_put(&self, store: &str, key: &str, value: &[u8]) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO aux_kv (store, key, value) VALUES (?, ?, ?)",
        params![store, key, value],
      )
      .map_err(|e| eyre!("Failed to write {}/{}: {}", store, key, e))?;
    Ok(())
  }

  fn drop_aux_store(&self, store: &str) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM aux_kv WHERE store = ?", params![store])
      .map_err(|e| eyre!("Failed to drop store {}: {}", store, e))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::OutboundRequest;
  use url::Url;

  fn key(url: &str) -> RequestKey {
    RequestKey::from_request(&OutboundRequest::get(Url::parse(url).unwrap()))
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let generation = CacheGeneration::for_version("1.0.0");
    storage.ensure_generation(&generation).unwrap();
    let k = key("https://app.example.com/index.html");

    storage
      .put_entry(&generation, &k, &[], &Response::new(200, "old"))
      .unwrap();
    storage
      .put_entry(&generation, &k, &[], &Response::new(200, "new"))
      .unwrap();

    let entries = storage.find_entries(&generation.name, &k, false).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].response.body, b"new");
    assert_eq!(storage.entry_count(&generation.name).unwrap(), 1);
  }

  #[test]
  fn test_put_into_missing_generation_is_skipped() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let generation = CacheGeneration::for_version("2.0.0");
    let k = key("https://app.example.com/a");

    let stored = storage
      .put_entry(&generation, &k, &[], &Response::new(200, "a"))
      .unwrap();
    assert!(!stored);
    assert!(storage.generations().unwrap().is_empty());
    assert_eq!(storage.entry_count(&generation.name).unwrap(), 0);
  }

  #[test]
  fn test_ignore_query_prefers_latest() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let generation = CacheGeneration::for_version("1.0.0");
    storage.ensure_generation(&generation).unwrap();
    let first = key("https://app.example.com/api/content?page=1");
    let second = key("https://app.example.com/api/content?page=2");

    storage
      .put_entry(&generation, &first, &[], &Response::new(200, "1"))
      .unwrap();
    storage
      .put_entry(&generation, &second, &[], &Response::new(200, "2"))
      .unwrap();

    let lookup = key("https://app.example.com/api/content");
    assert!(storage
      .find_entries(&generation.name, &lookup, false)
      .unwrap()
      .is_empty());

    let entries = storage.find_entries(&generation.name, &lookup, true).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].response.body, b"2");
  }

  #[test]
  fn test_delete_generation_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let generation = CacheGeneration::for_version("1.0.0");
    storage.ensure_generation(&generation).unwrap();
    let k = key("https://app.example.com/index.html");
    storage
      .put_entry(&generation, &k, &[], &Response::new(200, "x"))
      .unwrap();

    assert!(storage.delete_generation(&generation.name).unwrap());
    assert!(!storage.delete_generation(&generation.name).unwrap());
    assert!(storage.generations().unwrap().is_empty());
    assert!(storage
      .find_entries(&generation.name, &k, false)
      .unwrap()
      .is_empty());
  }

  #[test]
  fn test_headers_and_vary_round_trip() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let generation = CacheGeneration::for_version("1.0.0");
    storage.ensure_generation(&generation).unwrap();
    let k = key("https://app.example.com/index.html");
    let response = Response::new(200, "x").with_header("content-type", "text/html");
    let vary = vec![("accept-language".to_string(), Some("uk".to_string()))];

    storage.put_entry(&generation, &k, &vary, &response).unwrap();

    let entry = storage
      .find_entries(&generation.name, &k, false)
      .unwrap()
      .remove(0);
    assert_eq!(entry.response, response);
    assert_eq!(entry.vary, vary);
    assert_eq!(entry.url, "https://app.example.com/index.html");
  }

  #[test]
  fn test_aux_stores() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.aux_put("downloads", "a", b"1").unwrap();
    storage.aux_put("settings", "theme", b"dark").unwrap();

    storage.aux_put("settings", "theme", b"light").unwrap();

    assert_eq!(storage.aux_stores().unwrap(), vec!["downloads", "settings"]);
    storage.drop_aux_store("settings").unwrap();
    assert_eq!(storage.aux_stores().unwrap(), vec!["downloads"]);
  }

  #[test]
  fn test_open_on_disk_creates_parent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let storage = SqliteStorage::open(&path).unwrap();
    storage
      .ensure_generation(&CacheGeneration::for_version("1.0.0"))
      .unwrap();
    assert!(path.exists());

    drop(storage);
    let reopened = SqliteStorage::open(&path).unwrap();
    assert_eq!(reopened.generations().unwrap(), vec!["mtc-cache-1.0.0"]);
  }
}
