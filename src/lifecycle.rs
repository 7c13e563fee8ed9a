//! Install / activate state machine and control messages.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{ActiveVersion, CacheEntry, CacheHandle, CacheStore, CacheVersion, RequestKey};
use crate::http::{Network, Request};
use crate::sync::SyncQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Idle,
  Installing,
  Installed,
  Activating,
  Active,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// Inbound control message, parsed from `{ "type": ... }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  SkipWaiting,
  ClearCache,
  Unknown(String),
}

impl ControlMessage {
  pub fn parse(message: &Value) -> Self {
    match message.get("type").and_then(Value::as_str) {
      Some("SKIP_WAITING") => ControlMessage::SkipWaiting,
      Some("CLEAR_CACHE") => ControlMessage::ClearCache,
      Some(other) => ControlMessage::Unknown(other.to_string()),
      None => ControlMessage::Unknown(String::new()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
  Install,
  Activate,
  Message(ControlMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleReply {
  /// Install finished; `failed` assets were skipped
  Installed { warmed: usize, failed: usize },
  /// Activation finished after removing `removed` stale versions
  Activated { removed: usize },
  /// The current cache version was dropped
  CacheCleared { removed: bool },
  /// Nothing to do in the current state
  Ignored,
}

impl LifecycleReply {
  /// Acknowledgement sent back to whoever posted a control message.
  pub fn to_ack(&self) -> Value {
    match self {
      LifecycleReply::CacheCleared { removed } => {
        serde_json::json!({ "type": "CACHE_CLEARED", "removed": removed })
      }
      LifecycleReply::Activated { removed } => {
        serde_json::json!({ "type": "ACTIVATED", "removed": removed })
      }
      LifecycleReply::Installed { warmed, failed } => {
        serde_json::json!({ "type": "INSTALLED", "warmed": warmed, "failed": failed })
      }
      LifecycleReply::Ignored => serde_json::json!({ "type": "IGNORED" }),
    }
  }
}

/// Drives one cache version from install to active control.
pub struct LifecycleManager {
  version: CacheVersion,
  precache: Vec<Url>,
  cache: Arc<CacheStore>,
  network: Arc<dyn Network>,
  active: Arc<ActiveVersion>,
  queue: Arc<SyncQueue>,
  state: LifecycleState,
  handle: Option<CacheHandle>,
  skip_waiting: bool,
}

impl LifecycleManager {
  pub fn new(
    version: CacheVersion,
    precache: Vec<Url>,
    cache: Arc<CacheStore>,
    network: Arc<dyn Network>,
    active: Arc<ActiveVersion>,
    queue: Arc<SyncQueue>,
  ) -> Self {
    Self {
      version,
      precache,
      cache,
      network,
      active,
      queue,
      state: LifecycleState::Idle,
      handle: None,
      skip_waiting: false,
    }
  }

  /// Activate as soon as install completes.
  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  #[allow(dead_code)]
  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub async fn handle(&mut self, event: LifecycleEvent) -> Result<LifecycleReply> {
    match event {
      LifecycleEvent::Install => self.install().await,
      LifecycleEvent::Activate => self.activate(),
      LifecycleEvent::Message(message) => self.on_message(message).await,
    }
  }

  async fn install(&mut self) -> Result<LifecycleReply> {
    if self.state != LifecycleState::Idle {
      return Ok(LifecycleReply::Ignored);
    }
    self.state = LifecycleState::Installing;
    info!(version = %self.version, "Installing");

    let handle = match self.cache.open(&self.version) {
      Ok(handle) => handle,
      Err(e) => {
        self.state = LifecycleState::Idle;
        return Err(eyre!("Failed to open cache {}: {}", self.version, e));
      }
    };
    let (warmed, failed) = self.warm(&handle).await;
    self.handle = Some(handle);
    self.state = LifecycleState::Installed;
    info!(version = %self.version, warmed, failed, "Installed");

    if self.skip_waiting {
      self.activate()?;
    }
    Ok(LifecycleReply::Installed { warmed, failed })
  }

  /// Fetch every precache asset not already present. Failures are logged and
  /// skipped.
  async fn warm(&self, handle: &CacheHandle) -> (usize, usize) {
    let missing: Vec<Request> = self
      .precache
      .iter()
      .map(|url| Request::get(url.clone()))
      .filter(|request| {
        self
          .cache
          .get(handle, &RequestKey::from_request(request))
          .is_none()
      })
      .collect();

    let fetches = missing.iter().map(|request| async move {
      let key = RequestKey::from_request(request);
      let response = match self.network.fetch(request).await {
        Ok(response) => response,
        Err(e) => {
          warn!(url = %request.url, error = %e, "Precache fetch failed");
          return false;
        }
      };
      match self
        .cache
        .put(handle, CacheEntry::from_response(key, &response))
        .await
      {
        Ok(()) => true,
        Err(e) => {
          warn!(url = %request.url, error = %e, "Precache store failed");
          false
        }
      }
    });

    let results = futures::future::join_all(fetches).await;
    let warmed = results.iter().filter(|ok| **ok).count();
    (warmed, results.len() - warmed)
  }

  fn activate(&mut self) -> Result<LifecycleReply> {
    match self.state {
      LifecycleState::Installed => {}
      LifecycleState::Active => return Ok(LifecycleReply::Ignored),
      other => return Err(eyre!("Cannot activate while {}", other)),
    }
    let handle = self
      .handle
      .clone()
      .ok_or_else(|| eyre!("Installed without a cache handle"))?;

    self.state = LifecycleState::Activating;
    let removed = match self.cache.delete_all_except(&self.version) {
      Ok(removed) => removed,
      Err(e) => {
        self.state = LifecycleState::Installed;
        return Err(eyre!("Failed to remove stale caches: {}", e));
      }
    };

    self.active.claim(handle);
    self.state = LifecycleState::Active;
    info!(version = %self.version, removed, "Activated and claimed clients");
    Ok(LifecycleReply::Activated { removed })
  }

  async fn on_message(&mut self, message: ControlMessage) -> Result<LifecycleReply> {
    match message {
      ControlMessage::SkipWaiting => match self.state {
        LifecycleState::Installed => self.activate(),
        LifecycleState::Idle | LifecycleState::Installing => {
          self.skip_waiting = true;
          Ok(LifecycleReply::Ignored)
        }
        LifecycleState::Activating | LifecycleState::Active => Ok(LifecycleReply::Ignored),
      },
      ControlMessage::ClearCache => self.clear_cache().await,
      ControlMessage::Unknown(kind) => {
        warn!(message_type = %kind, "Ignoring unknown control message");
        Ok(LifecycleReply::Ignored)
      }
    }
  }

  /// Drop the current version. Waits for any in-flight drain first, and keeps
  /// serving from a fresh empty namespace afterwards.
  async fn clear_cache(&mut self) -> Result<LifecycleReply> {
    self.queue.wait_idle().await;

    let removed = self
      .cache
      .delete_version(&self.version)
      .map_err(|e| eyre!("Failed to clear cache {}: {}", self.version, e))?;

    if self.handle.is_some() {
      let handle = self
        .cache
        .open(&self.version)
        .map_err(|e| eyre!("Failed to reopen cache {}: {}", self.version, e))?;
      if self.state == LifecycleState::Active {
        self.active.claim(handle.clone());
      }
      self.handle = Some(handle);
    }

    info!(version = %self.version, removed, "Cache cleared");
    Ok(LifecycleReply::CacheCleared { removed })
  }
}
