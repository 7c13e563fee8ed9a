//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::key::RequestKey;
use super::types::{CacheEntry, CacheVersion};
use crate::db::Database;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace for a version if it does not exist yet.
  fn create_version(&self, version: &CacheVersion) -> Result<()>;

  /// All namespaces currently present.
  fn list_versions(&self) -> Result<Vec<CacheVersion>>;

  /// Drop a namespace and every entry under it.
  fn delete_version(&self, version: &CacheVersion) -> Result<bool>;

  /// Store an entry, replacing any previous entry for the same key.
  /// Fails if the namespace does not exist.
  fn store_entry(&self, version: &CacheVersion, entry: &CacheEntry) -> Result<()>;

  /// Get a single entry by key.
  fn load_entry(&self, version: &CacheVersion, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Remove a single entry.
  fn delete_entry(&self, version: &CacheVersion, key: &RequestKey) -> Result<bool>;

  /// Keys of all entries under a version.
  fn entry_keys(&self, version: &CacheVersion) -> Result<Vec<RequestKey>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn create_version(&self, version: &CacheVersion) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_versions (version, created_at) VALUES (?, ?)",
        params![version.as_str(), format_datetime(&Utc::now())],
      )
      .map_err(|e| eyre!("Failed to create cache version {}: {}", version, e))?;
    Ok(())
  }

  fn list_versions(&self) -> Result<Vec<CacheVersion>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT version FROM cache_versions ORDER BY created_at, version")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let versions = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list cache versions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache version: {}", e))?;

    Ok(versions.into_iter().map(CacheVersion::new).collect())
  }

  fn delete_version(&self, version: &CacheVersion) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE version = ?",
      params![version.as_str()],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", version, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_versions WHERE version = ?",
        params![version.as_str()],
      )
      .map_err(|e| eyre!("Failed to delete cache version {}: {}", version, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn store_entry(&self, version: &CacheVersion, entry: &CacheEntry) -> Result<()> {
    let conn = self.db.conn()?;
    let vary = serde_json::to_string(&entry.key.vary)
      .map_err(|e| eyre!("Failed to serialize vary headers: {}", e))?;
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    // Single statement: the whole entry lands or nothing does.
    let written = conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (version, key_hash, method, url, vary, status, headers, body, stored_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
         WHERE EXISTS (SELECT 1 FROM cache_versions WHERE version = ?1)",
        params![
          version.as_str(),
          entry.key.cache_hash(),
          entry.key.method,
          entry.key.url,
          vary,
          entry.status,
          headers,
          entry.body,
          format_datetime(&entry.stored_at),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.key, e))?;

    if written == 0 {
      return Err(eyre!("Cache version {} does not exist", version));
    }
    Ok(())
  }

  fn load_entry(&self, version: &CacheVersion, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE version = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![version.as_str(), key.cache_hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to load cache entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Corrupt headers for {}: {}", key, e))?;
        Ok(Some(CacheEntry {
          key: key.clone(),
          status,
          headers,
          body,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete_entry(&self, version: &CacheVersion, key: &RequestKey) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE version = ? AND key_hash = ?",
        params![version.as_str(), key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn entry_keys(&self, version: &CacheVersion) -> Result<Vec<RequestKey>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT method, url, vary FROM cache_entries WHERE version = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![version.as_str()], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url, vary)| {
        let vary = serde_json::from_str(&vary)
          .map_err(|e| eyre!("Corrupt vary headers for {}: {}", url, e))?;
        Ok(RequestKey { method, url, vary })
      })
      .collect()
  }
}

/// Format a timestamp so that lexical order matches chronological order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by `format_datetime`.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
