pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Shared SQLite connection for the cache store, sync queue and notification log.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database inside `data_dir`.
  pub fn open(data_dir: &Path) -> Result<Self> {
    std::fs::create_dir_all(data_dir)
      .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

    let path = data_dir.join("medsync.db");
    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    conn
      .execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    // Columns added after the table was first created
    add_column_if_missing(&conn, "sync_tasks", "claimed_at", "TEXT")?;
    Ok(())
  }

  /// Lock the connection.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
  let present: i64 = conn
    .query_row(
      "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
      params![table, column],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to inspect table {}: {}", table, e))?;

  if present == 0 {
    conn
      .execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
      .map_err(|e| eyre!("Failed to add column {}.{}: {}", table, column, e))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_are_idempotent() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().unwrap();

    let tables: i64 = db
      .conn()
      .unwrap()
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
         ('cache_versions', 'cache_entries', 'sync_tasks', 'displayed_notifications')",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(tables, 4);
  }

  #[test]
  fn test_migration_adds_claim_column_to_existing_queue() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch(
        "CREATE TABLE sync_tasks (
           seq INTEGER PRIMARY KEY AUTOINCREMENT,
           id TEXT NOT NULL UNIQUE,
           method TEXT NOT NULL,
           url TEXT NOT NULL,
           headers TEXT NOT NULL,
           body BLOB NOT NULL,
           created_at TEXT NOT NULL,
           attempts INTEGER NOT NULL DEFAULT 0,
           max_attempts INTEGER NOT NULL,
           status TEXT NOT NULL,
           last_error TEXT
         );",
      )
      .unwrap();
    let db = Database {
      conn: Mutex::new(conn),
    };
    db.run_migrations().unwrap();
    db.run_migrations().unwrap();

    let columns: i64 = db
      .conn()
      .unwrap()
      .query_row(
        "SELECT COUNT(*) FROM pragma_table_info('sync_tasks') WHERE name = 'claimed_at'",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(columns, 1);
  }
}
