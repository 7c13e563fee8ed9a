//! Replay queue for mutations that failed while offline.

use chrono::Utc;
use color_eyre::{eyre::eyre, Report, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::storage::QueueStorage;
use super::task::{RequestSnapshot, SyncTask, TaskStatus};
use crate::http::Network;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Tasks replayed with a 2xx and removed
  pub succeeded: usize,
  /// Replays that did not succeed during this pass
  pub failed: usize,
  /// Pending tasks left after the pass
  pub remaining: usize,
}

type DrainSignal = watch::Receiver<Option<DrainReport>>;

/// How long a Replaying task may stay claimed before another drain treats
/// its owner as dead.
const DEFAULT_CLAIM_LEASE_SECS: i64 = 300;

/// Durable FIFO of failed mutations.
///
/// Only one drain runs at a time. A drain requested while another is in
/// flight performs no replay of its own; it waits for the in-flight drain and
/// returns that drain's report. Across processes sharing the database, each
/// task is claimed atomically before replay so no two drains send it.
pub struct SyncQueue {
  storage: Arc<dyn QueueStorage>,
  network: Arc<dyn Network>,
  max_attempts: u32,
  claim_lease: chrono::Duration,
  in_flight: Mutex<Option<DrainSignal>>,
}

/// Clears the in-flight slot when the leading drain finishes or is dropped.
struct DrainGuard<'a> {
  slot: &'a Mutex<Option<DrainSignal>>,
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    if let Ok(mut slot) = self.slot.lock() {
      *slot = None;
    }
  }
}

impl SyncQueue {
  pub fn open(
    storage: Arc<dyn QueueStorage>,
    network: Arc<dyn Network>,
    max_attempts: u32,
  ) -> Result<Self> {
    Ok(Self {
      storage,
      network,
      max_attempts,
      claim_lease: chrono::Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
      in_flight: Mutex::new(None),
    })
  }

  /// Tasks claimed longer ago than `lease` are assumed orphaned by a crashed
  /// drain and go back to Pending. Must exceed the network timeout.
  pub fn with_claim_lease(mut self, lease: chrono::Duration) -> Self {
    self.claim_lease = lease;
    self
  }

  /// Persist a snapshot as a new Pending task.
  pub fn enqueue(&self, snapshot: RequestSnapshot) -> Result<SyncTask> {
    let task = SyncTask::new(snapshot, self.max_attempts);
    self.storage.insert(&task)?;
    info!(
      task_id = %task.id,
      method = %task.snapshot.method,
      url = %task.snapshot.url,
      "Queued request for background sync"
    );
    Ok(task)
  }

  /// Replay every Pending task once, oldest first.
  pub async fn drain_once(&self) -> Result<DrainReport> {
    let (leader, mut signal) = {
      let mut slot = self
        .in_flight
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      match slot.as_ref() {
        Some(signal) => (None, signal.clone()),
        None => {
          let (tx, rx) = watch::channel(None);
          *slot = Some(rx.clone());
          (Some(tx), rx)
        }
      }
    };

    let Some(tx) = leader else {
      debug!("Drain already in flight, waiting for it");
      let report = *signal
        .wait_for(Option::is_some)
        .await
        .map_err(|_| eyre!("In-flight drain ended without a report"))?;
      return report.ok_or_else(|| eyre!("In-flight drain ended without a report"));
    };

    let guard = DrainGuard {
      slot: &self.in_flight,
    };
    let report = self.replay_pending().await?;
    drop(guard);
    let _ = tx.send(Some(report));

    Ok(report)
  }

  /// Wait until no drain is in flight.
  pub async fn wait_idle(&self) {
    let signal = match self.in_flight.lock() {
      Ok(slot) => slot.clone(),
      Err(_) => None,
    };
    if let Some(mut signal) = signal {
      let _ = signal.wait_for(Option::is_some).await;
    }
  }

  async fn replay_pending(&self) -> Result<DrainReport> {
    let recovered = self
      .storage
      .reset_interrupted(Utc::now() - self.claim_lease)?;
    if recovered > 0 {
      info!(count = recovered, "Recovered interrupted sync tasks");
    }

    let mut report = DrainReport::default();
    for mut task in self.storage.list_by_status(TaskStatus::Pending)? {
      match self.storage.claim(task.id, Utc::now()) {
        Ok(true) => task.status = TaskStatus::Replaying,
        Ok(false) => {
          debug!(task_id = %task.id, "Sync task claimed by another drain");
          continue;
        }
        Err(e) => {
          warn!(task_id = %task.id, error = %e, "Failed to claim sync task");
          continue;
        }
      }

      match self.replay(&mut task).await {
        Ok(true) => report.succeeded += 1,
        Ok(false) => report.failed += 1,
        Err(e) => {
          report.failed += 1;
          self.release(&mut task, &e);
        }
      }
    }

    report.remaining = self.storage.count_by_status(TaskStatus::Pending)?;
    Ok(report)
  }

  /// Replay one claimed task and store the outcome. Returns whether the
  /// replay succeeded; errors are storage failures while recording it.
  async fn replay(&self, task: &mut SyncTask) -> Result<bool> {
    let request = match task.snapshot.to_request() {
      Ok(request) => request,
      Err(e) => {
        task.record_permanent_failure(e.to_string());
        self.storage.update(task)?;
        warn!(task_id = %task.id, error = %e, "Sync task cannot be replayed");
        return Ok(false);
      }
    };

    match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => {
        task.status = TaskStatus::Succeeded;
        self.storage.remove(task.id)?;
        info!(task_id = %task.id, status = response.status, "Replayed sync task");
        Ok(true)
      }
      Ok(response) if response.is_client_error() => {
        // Retrying would repeat a guaranteed failure.
        task.record_permanent_failure(format!("rejected with status {}", response.status));
        self.storage.update(task)?;
        warn!(task_id = %task.id, status = response.status, "Sync task rejected by server");
        Ok(false)
      }
      Ok(response) => {
        task.record_failure(format!("server returned status {}", response.status));
        self.storage.update(task)?;
        self.log_failure(task);
        Ok(false)
      }
      Err(e) => {
        task.record_failure(e.to_string());
        self.storage.update(task)?;
        self.log_failure(task);
        Ok(false)
      }
    }
  }

  /// Hand back a task whose outcome could not be stored. A task that was
  /// replayed but not removed goes back to Pending; the idempotency key makes
  /// the repeat safe. If this write fails too, the claim lease recovers it.
  fn release(&self, task: &mut SyncTask, cause: &Report) {
    if matches!(task.status, TaskStatus::Replaying | TaskStatus::Succeeded) {
      task.status = TaskStatus::Pending;
    }
    match self.storage.update(task) {
      Ok(()) => warn!(
        task_id = %task.id,
        status = %task.status,
        error = %cause,
        "Failed to record sync outcome, task released"
      ),
      Err(e) => error!(
        task_id = %task.id,
        error = %e,
        cause = %cause,
        "Failed to release sync task, waiting for its claim to expire"
      ),
    }
  }

  fn log_failure(&self, task: &SyncTask) {
    if task.status == TaskStatus::Failed {
      warn!(
        task_id = %task.id,
        attempts = task.attempts,
        error = task.last_error.as_deref().unwrap_or_default(),
        "Sync task exhausted its retries"
      );
    } else {
      debug!(
        task_id = %task.id,
        attempts = task.attempts,
        error = task.last_error.as_deref().unwrap_or_default(),
        "Sync replay failed, will retry"
      );
    }
  }

  /// Number of tasks waiting for the next drain.
  pub fn pending_count(&self) -> Result<usize> {
    self.storage.count_by_status(TaskStatus::Pending)
  }

  /// Tasks a drain currently owns, here or in another process.
  pub fn replaying_count(&self) -> Result<usize> {
    self.storage.count_by_status(TaskStatus::Replaying)
  }

  /// Tasks that need manual attention.
  pub fn failed_tasks(&self) -> Result<Vec<SyncTask>> {
    self.storage.list_by_status(TaskStatus::Failed)
  }

  /// Give a Failed task a fresh set of attempts.
  pub fn retry_failed(&self, id: Uuid) -> Result<bool> {
    match self.storage.get(id)? {
      Some(mut task) if task.status == TaskStatus::Failed => {
        task.status = TaskStatus::Pending;
        task.attempts = 0;
        task.last_error = None;
        self.storage.update(&task)?;
        info!(task_id = %id, "Failed sync task re-queued");
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  /// Drop a Failed task at the user's request. Pending tasks are never
  /// discarded.
  pub fn discard(&self, id: Uuid) -> Result<bool> {
    match self.storage.get(id)? {
      Some(task) if task.status == TaskStatus::Failed => {
        let removed = self.storage.remove(id)?;
        if removed {
          info!(task_id = %id, "Failed sync task discarded");
        }
        Ok(removed)
      }
      _ => Ok(false),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::testing::ScriptedNetwork;
  use crate::sync::SqliteQueueStorage;
  use std::collections::BTreeMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn snapshot(path: &str) -> RequestSnapshot {
    RequestSnapshot {
      method: "POST".to_string(),
      url: format!("https://app.test{}", path),
      headers: BTreeMap::from([("idempotency-key".to_string(), Uuid::new_v4().to_string())]),
      body: br#"{"doctorId":3,"slot":"2026-10-16T14:00:00Z"}"#.to_vec(),
    }
  }

  fn setup(network: ScriptedNetwork, max_attempts: u32) -> (Arc<Database>, Arc<ScriptedNetwork>, SyncQueue) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = Arc::new(network);
    let queue = SyncQueue::open(
      Arc::new(SqliteQueueStorage::new(Arc::clone(&db))),
      network.clone(),
      max_attempts,
    )
    .unwrap();
    (db, network, queue)
  }

  #[tokio::test]
  async fn test_offline_post_replays_when_network_returns() {
    let (_db, network, queue) = setup(ScriptedNetwork::new(), 5);
    network.route("/api/appointments", 201, b"{}");
    network.set_online(false);

    let task = queue.enqueue(snapshot("/api/appointments")).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(queue.pending_count().unwrap(), 1);

    network.set_online(true);
    let report = queue.drain_once().await.unwrap();
    assert_eq!(
      report,
      DrainReport {
        succeeded: 1,
        failed: 0,
        remaining: 0
      }
    );
    assert_eq!(queue.pending_count().unwrap(), 0);
    assert!(queue.storage.get(task.id).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_drain_replays_in_fifo_order() {
    let (_db, network, queue) = setup(ScriptedNetwork::new(), 5);
    for path in ["/api/a", "/api/b", "/api/c"] {
      network.route(path, 200, b"ok");
      queue.enqueue(snapshot(path)).unwrap();
    }

    queue.drain_once().await.unwrap();
    let paths: Vec<String> = network
      .requests()
      .iter()
      .map(|r| r.url.path().to_string())
      .collect();
    assert_eq!(paths, vec!["/api/a", "/api/b", "/api/c"]);
  }

  #[tokio::test]
  async fn test_exhausted_task_is_kept_as_failed() {
    let (_db, network, queue) = setup(ScriptedNetwork::new(), 2);
    network.set_online(false);
    let task = queue.enqueue(snapshot("/api/appointments")).unwrap();

    let first = queue.drain_once().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.remaining, 1);

    let second = queue.drain_once().await.unwrap();
    assert_eq!(second.failed, 1);
    assert_eq!(second.remaining, 0);

    // Further drains do not touch it.
    let third = queue.drain_once().await.unwrap();
    assert_eq!(third, DrainReport::default());

    let failed = queue.failed_tasks().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, task.id);
    assert_eq!(failed[0].attempts, 2);
    assert_eq!(network.calls(), 2);
  }

  #[tokio::test]
  async fn test_client_error_fails_without_retry() {
    let (_db, network, queue) = setup(ScriptedNetwork::new(), 5);
    network.route("/api/appointments", 422, br#"{"error":"slot taken"}"#);
    queue.enqueue(snapshot("/api/appointments")).unwrap();

    let report = queue.drain_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 0);

    let failed = queue.failed_tasks().unwrap();
    assert_eq!(failed[0].attempts, 1);
    assert_eq!(
      failed[0].last_error.as_deref(),
      Some("rejected with status 422")
    );
  }

  #[tokio::test]
  async fn test_server_error_is_retried() {
    let (_db, network, queue) = setup(ScriptedNetwork::new(), 5);
    network.route("/api/appointments", 503, b"");
    queue.enqueue(snapshot("/api/appointments")).unwrap();

    let report = queue.drain_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);
    assert!(queue.failed_tasks().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_restart_mid_replay_replays_exactly_once() {
    let (db, network, queue) = setup(ScriptedNetwork::new(), 5);
    network.route("/api/appointments", 201, b"{}");
    let task = queue.enqueue(snapshot("/api/appointments")).unwrap();

    // Crash after the task was claimed but before the outcome was stored.
    let storage = SqliteQueueStorage::new(Arc::clone(&db));
    storage
      .claim(task.id, Utc::now() - chrono::Duration::minutes(10))
      .unwrap();
    drop(queue);

    let restarted = SyncQueue::open(
      Arc::new(SqliteQueueStorage::new(db)),
      network.clone(),
      5,
    )
    .unwrap();
    assert_eq!(restarted.replaying_count().unwrap(), 1);

    let report = restarted.drain_once().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(restarted.replaying_count().unwrap(), 0);
    assert_eq!(network.calls_to("/api/appointments"), 1);
    assert!(restarted.storage.get(task.id).unwrap().is_none());

    let again = restarted.drain_once().await.unwrap();
    assert_eq!(again, DrainReport::default());
    assert_eq!(network.calls_to("/api/appointments"), 1);
  }

  #[tokio::test]
  async fn test_concurrent_drains_coalesce() {
    let (_db, network, queue) = setup(
      ScriptedNetwork::new().with_delay(Duration::from_millis(50)),
      5,
    );
    network.route("/api/appointments", 201, b"{}");
    queue.enqueue(snapshot("/api/appointments")).unwrap();

    let (a, b) = tokio::join!(queue.drain_once(), queue.drain_once());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a, b);
    assert_eq!(a.succeeded, 1);
    assert_eq!(network.calls(), 1);
    assert!(queue.in_flight.lock().unwrap().is_none());
  }

  #[tokio::test]
  async fn test_retry_and_discard_failed() {
    let (_db, network, queue) = setup(ScriptedNetwork::new(), 1);
    network.set_online(false);
    let retried = queue.enqueue(snapshot("/api/a")).unwrap();
    let discarded = queue.enqueue(snapshot("/api/b")).unwrap();
    queue.drain_once().await.unwrap();
    assert_eq!(queue.failed_tasks().unwrap().len(), 2);

    assert!(queue.retry_failed(retried.id).unwrap());
    assert!(queue.discard(discarded.id).unwrap());
    assert!(!queue.discard(retried.id).unwrap());

    network.set_online(true);
    network.route("/api/a", 200, b"ok");
    let report = queue.drain_once().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(queue.failed_tasks().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_second_process_skips_claimed_tasks() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = Arc::new(ScriptedNetwork::new().with_delay(Duration::from_millis(100)));
    network.route("/api/appointments", 201, b"{}");
    let first = SyncQueue::open(
      Arc::new(SqliteQueueStorage::new(Arc::clone(&db))),
      network.clone(),
      5,
    )
    .unwrap();
    first.enqueue(snapshot("/api/appointments")).unwrap();

    let (a, b) = tokio::join!(first.drain_once(), async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      // Another process opening the same database mid-drain.
      let second = SyncQueue::open(
        Arc::new(SqliteQueueStorage::new(Arc::clone(&db))),
        network.clone(),
        5,
      )
      .unwrap();
      second.drain_once().await
    });

    assert_eq!(a.unwrap().succeeded, 1);
    assert_eq!(b.unwrap(), DrainReport::default());
    assert_eq!(network.calls_to("/api/appointments"), 1);
  }

  /// Sqlite storage whose next `fail_updates` writes are refused.
  struct LockedStorage {
    inner: SqliteQueueStorage,
    fail_updates: AtomicUsize,
  }

  impl LockedStorage {
    fn new(db: Arc<Database>) -> Self {
      Self {
        inner: SqliteQueueStorage::new(db),
        fail_updates: AtomicUsize::new(0),
      }
    }
  }

  impl QueueStorage for LockedStorage {
    fn insert(&self, task: &SyncTask) -> Result<()> {
      self.inner.insert(task)
    }
    fn get(&self, id: Uuid) -> Result<Option<SyncTask>> {
      self.inner.get(id)
    }
    fn update(&self, task: &SyncTask) -> Result<()> {
      let refused = self
        .fail_updates
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
      if refused {
        return Err(eyre!("database is locked"));
      }
      self.inner.update(task)
    }
    fn claim(&self, id: Uuid, at: chrono::DateTime<Utc>) -> Result<bool> {
      self.inner.claim(id, at)
    }
    fn remove(&self, id: Uuid) -> Result<bool> {
      self.inner.remove(id)
    }
    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<SyncTask>> {
      self.inner.list_by_status(status)
    }
    fn count_by_status(&self, status: TaskStatus) -> Result<usize> {
      self.inner.count_by_status(status)
    }
    fn reset_interrupted(&self, claimed_before: chrono::DateTime<Utc>) -> Result<usize> {
      self.inner.reset_interrupted(claimed_before)
    }
  }

  #[tokio::test]
  async fn test_storage_error_releases_task_and_drain_continues() {
    let storage = Arc::new(LockedStorage::new(Arc::new(Database::open_in_memory().unwrap())));
    let network = Arc::new(ScriptedNetwork::new());
    let queue = SyncQueue::open(storage.clone(), network.clone(), 5).unwrap();
    network.route("/api/a", 503, b"");
    network.route("/api/b", 201, b"{}");
    let a = queue.enqueue(snapshot("/api/a")).unwrap();
    queue.enqueue(snapshot("/api/b")).unwrap();

    storage.fail_updates.store(1, Ordering::SeqCst);
    let report = queue.drain_once().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);
    assert_eq!(queue.replaying_count().unwrap(), 0);
    assert_eq!(storage.get(a.id).unwrap().unwrap().status, TaskStatus::Pending);

    network.route("/api/a", 201, b"{}");
    let report = queue.drain_once().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(queue.pending_count().unwrap(), 0);
    assert_eq!(queue.replaying_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_unreleasable_task_is_recovered_after_lease() {
    let storage = Arc::new(LockedStorage::new(Arc::new(Database::open_in_memory().unwrap())));
    let network = Arc::new(ScriptedNetwork::new());
    let queue = SyncQueue::open(storage.clone(), network.clone(), 5)
      .unwrap()
      .with_claim_lease(chrono::Duration::zero());
    network.set_online(false);
    queue.enqueue(snapshot("/api/appointments")).unwrap();

    // Both the outcome write and the release are refused.
    storage.fail_updates.store(2, Ordering::SeqCst);
    let report = queue.drain_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(queue.replaying_count().unwrap(), 1);

    network.set_online(true);
    network.route("/api/appointments", 201, b"{}");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = queue.drain_once().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(queue.replaying_count().unwrap(), 0);
    assert_eq!(queue.pending_count().unwrap(), 0);
  }
}
