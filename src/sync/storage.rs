//! Durable storage for queued sync tasks.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::task::{RequestSnapshot, SyncTask, TaskStatus};
use crate::cache::{format_datetime, parse_datetime};
use crate::db::Database;

/// Storage trait for the sync queue
pub trait QueueStorage: Send + Sync {
  /// Persist a new task.
  fn insert(&self, task: &SyncTask) -> Result<()>;

  /// Get a task by ID
  fn get(&self, id: Uuid) -> Result<Option<SyncTask>>;

  /// Write back status, attempt count and last error, releasing any claim.
  fn update(&self, task: &SyncTask) -> Result<()>;

  /// Move a Pending task to Replaying for the caller. Returns false when the
  /// task is no longer Pending, e.g. another process claimed it first.
  fn claim(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

  /// Delete a task; returns whether it existed.
  fn remove(&self, id: Uuid) -> Result<bool>;

  /// Tasks with the given status, oldest first.
  fn list_by_status(&self, status: TaskStatus) -> Result<Vec<SyncTask>>;

  fn count_by_status(&self, status: TaskStatus) -> Result<usize>;

  /// Move tasks claimed before `claimed_before` and still Replaying back to
  /// Pending. Tasks without a claim time count as stale.
  fn reset_interrupted(&self, claimed_before: DateTime<Utc>) -> Result<usize>;
}

pub struct SqliteQueueStorage {
  db: Arc<Database>,
}

impl SqliteQueueStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

const TASK_COLUMNS: &str =
  "id, method, url, headers, body, created_at, attempts, max_attempts, status, last_error";

struct TaskRow {
  id: String,
  method: String,
  url: String,
  headers: String,
  body: Vec<u8>,
  created_at: String,
  attempts: u32,
  max_attempts: u32,
  status: String,
  last_error: Option<String>,
}

impl TaskRow {
  fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      method: row.get(1)?,
      url: row.get(2)?,
      headers: row.get(3)?,
      body: row.get(4)?,
      created_at: row.get(5)?,
      attempts: row.get(6)?,
      max_attempts: row.get(7)?,
      status: row.get(8)?,
      last_error: row.get(9)?,
    })
  }

  fn into_task(self) -> Result<SyncTask> {
    let headers: BTreeMap<String, String> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Corrupt headers for task {}: {}", self.id, e))?;

    Ok(SyncTask {
      id: Uuid::parse_str(&self.id).map_err(|e| eyre!("Invalid task id '{}': {}", self.id, e))?,
      snapshot: RequestSnapshot {
        method: self.method,
        url: self.url,
        headers,
        body: self.body,
      },
      created_at: parse_datetime(&self.created_at)?,
      attempts: self.attempts,
      max_attempts: self.max_attempts,
      status: self.status.parse()?,
      last_error: self.last_error,
    })
  }
}

impl QueueStorage for SqliteQueueStorage {
  fn insert(&self, task: &SyncTask) -> Result<()> {
    let conn = self.db.conn()?;
    let headers = serde_json::to_string(&task.snapshot.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_tasks
           (id, method, url, headers, body, created_at, attempts, max_attempts, status, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          task.id.to_string(),
          task.snapshot.method,
          task.snapshot.url,
          headers,
          task.snapshot.body,
          format_datetime(&task.created_at),
          task.attempts,
          task.max_attempts,
          task.status.as_str(),
          task.last_error,
        ],
      )
      .map_err(|e| eyre!("Failed to persist sync task {}: {}", task.id, e))?;

    Ok(())
  }

  fn get(&self, id: Uuid) -> Result<Option<SyncTask>> {
    let conn = self.db.conn()?;
    let row = conn
      .query_row(
        &format!("SELECT {} FROM sync_tasks WHERE id = ?", TASK_COLUMNS),
        params![id.to_string()],
        TaskRow::read,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load sync task {}: {}", id, e))?;

    row.map(TaskRow::into_task).transpose()
  }

  fn update(&self, task: &SyncTask) -> Result<()> {
    let conn = self.db.conn()?;
    let updated = conn
      .execute(
        "UPDATE sync_tasks SET attempts = ?, status = ?, last_error = ?, claimed_at = NULL
         WHERE id = ?",
        params![
          task.attempts,
          task.status.as_str(),
          task.last_error,
          task.id.to_string()
        ],
      )
      .map_err(|e| eyre!("Failed to update sync task {}: {}", task.id, e))?;

    if updated == 0 {
      return Err(eyre!("Sync task {} not found", task.id));
    }
    Ok(())
  }

  fn claim(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
    let conn = self.db.conn()?;
    let claimed = conn
      .execute(
        "UPDATE sync_tasks SET status = ?, claimed_at = ? WHERE id = ? AND status = ?",
        params![
          TaskStatus::Replaying.as_str(),
          format_datetime(&at),
          id.to_string(),
          TaskStatus::Pending.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to claim sync task {}: {}", id, e))?;
    Ok(claimed > 0)
  }

  fn remove(&self, id: Uuid) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM sync_tasks WHERE id = ?",
        params![id.to_string()],
      )
      .map_err(|e| eyre!("Failed to remove sync task {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn list_by_status(&self, status: TaskStatus) -> Result<Vec<SyncTask>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM sync_tasks WHERE status = ? ORDER BY created_at, seq",
        TASK_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![status.as_str()], TaskRow::read)
      .map_err(|e| eyre!("Failed to query sync tasks: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync task: {}", e))?;

    rows.into_iter().map(TaskRow::into_task).collect()
  }

  fn count_by_status(&self, status: TaskStatus) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sync_tasks WHERE status = ?",
        params![status.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count sync tasks: {}", e))?;
    Ok(count as usize)
  }

  fn reset_interrupted(&self, claimed_before: DateTime<Utc>) -> Result<usize> {
    let conn = self.db.conn()?;
    let reset = conn
      .execute(
        "UPDATE sync_tasks SET status = ?, claimed_at = NULL
         WHERE status = ? AND (claimed_at IS NULL OR claimed_at < ?)",
        params![
          TaskStatus::Pending.as_str(),
          TaskStatus::Replaying.as_str(),
          format_datetime(&claimed_before)
        ],
      )
      .map_err(|e| eyre!("Failed to recover interrupted sync tasks: {}", e))?;
    Ok(reset)
  }
}
