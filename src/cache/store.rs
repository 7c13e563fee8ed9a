//! Versioned cache store: the only owner of cached responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::key::RequestKey;
use super::storage::CacheStorage;
use super::types::{CacheEntry, CacheError, CacheVersion};

/// An opened cache namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
  version: CacheVersion,
}

impl CacheHandle {
  pub fn version(&self) -> &CacheVersion {
    &self.version
  }
}

type WriteLock = Arc<tokio::sync::Mutex<()>>;

/// Cache store that serializes writes per key and only admits successful
/// responses.
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
  write_locks: Mutex<HashMap<(CacheVersion, String), WriteLock>>,
}

impl CacheStore {
  pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
    Self {
      storage,
      write_locks: Mutex::new(HashMap::new()),
    }
  }

  /// Open (creating if needed) the namespace for `version`.
  pub fn open(&self, version: &CacheVersion) -> Result<CacheHandle, CacheError> {
    self.storage.create_version(version)?;
    Ok(CacheHandle {
      version: version.clone(),
    })
  }

  /// Store an entry. Non-2xx entries are refused here so no strategy can
  /// cache an error body.
  pub async fn put(&self, handle: &CacheHandle, entry: CacheEntry) -> Result<(), CacheError> {
    if !entry.is_success() {
      return Err(CacheError::Uncacheable {
        key: entry.key.to_string(),
        status: entry.status,
      });
    }

    let slot = (handle.version.clone(), entry.key.cache_hash());
    let lock = self.write_lock(&slot)?;
    let result = {
      let _guard = lock.lock().await;
      self.storage.store_entry(&handle.version, &entry)
    };
    self.release_write_lock(&slot, lock);

    result?;
    debug!(key = %entry.key, version = %handle.version, "Cached response");
    Ok(())
  }

  /// Look up an entry. Storage failures are logged and reported as a miss.
  pub fn get(&self, handle: &CacheHandle, key: &RequestKey) -> Option<CacheEntry> {
    match self.storage.load_entry(&handle.version, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache read failed, treating as miss");
        None
      }
    }
  }

  /// Remove one entry, queued behind any in-flight write for the same key.
  pub async fn delete(&self, handle: &CacheHandle, key: &RequestKey) -> bool {
    let slot = (handle.version.clone(), key.cache_hash());
    let lock = match self.write_lock(&slot) {
      Ok(lock) => lock,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache delete failed");
        return false;
      }
    };
    let result = {
      let _guard = lock.lock().await;
      self.storage.delete_entry(&handle.version, key)
    };
    self.release_write_lock(&slot, lock);

    result.unwrap_or_else(|e| {
      warn!(key = %key, error = %e, "Cache delete failed");
      false
    })
  }

  /// Keys stored under a handle.
  pub fn keys(&self, handle: &CacheHandle) -> Vec<RequestKey> {
    self
      .storage
      .entry_keys(&handle.version)
      .unwrap_or_else(|e| {
        warn!(version = %handle.version, error = %e, "Failed to enumerate cache keys");
        Vec::new()
      })
  }

  /// All namespaces currently present.
  pub fn versions(&self) -> Result<Vec<CacheVersion>, CacheError> {
    Ok(self.storage.list_versions()?)
  }

  /// Drop one namespace entirely.
  pub fn delete_version(&self, version: &CacheVersion) -> Result<bool, CacheError> {
    let removed = self.storage.delete_version(version)?;
    if removed {
      info!(version = %version, "Deleted cache version");
    }
    Ok(removed)
  }

  /// Delete every namespace other than `current`; returns how many were
  /// removed. Safe to re-run.
  pub fn delete_all_except(&self, current: &CacheVersion) -> Result<usize, CacheError> {
    let mut removed = 0;
    for version in self.versions()? {
      if &version != current && self.delete_version(&version)? {
        removed += 1;
      }
    }
    Ok(removed)
  }

  fn write_lock(&self, slot: &(CacheVersion, String)) -> Result<WriteLock, CacheError> {
    let mut locks = self
      .write_locks
      .lock()
      .map_err(|e| CacheError::Storage(format!("Lock poisoned: {}", e)))?;
    Ok(Arc::clone(locks.entry(slot.clone()).or_default()))
  }

  fn release_write_lock(&self, slot: &(CacheVersion, String), lock: WriteLock) {
    if let Ok(mut locks) = self.write_locks.lock() {
      // Map + this holder: nobody else is waiting on the key.
      if Arc::strong_count(&lock) == 2 {
        locks.remove(slot);
      }
    }
  }
}

/// The cache namespace currently serving intercepted requests.
///
/// Requests read the handle once when they start, so a request already in
/// flight finishes against the version it began with.
#[derive(Default)]
pub struct ActiveVersion {
  handle: RwLock<Option<CacheHandle>>,
}

impl ActiveVersion {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn claim(&self, handle: CacheHandle) {
    if let Ok(mut slot) = self.handle.write() {
      *slot = Some(handle);
    }
  }

  pub fn current(&self) -> Option<CacheHandle> {
    self.handle.read().ok().and_then(|slot| slot.clone())
  }
}
