//! Host-facing runtime: wires the components together and exposes the
//! lifecycle, fetch, sync, push, click and message hooks.

use chrono::Utc;
use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{ActiveVersion, CacheStore, CacheVersion, RequestKey, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::event::{EventHandler, HostEvent};
use crate::http::{HttpNetwork, Network, Request, Response};
use crate::lifecycle::{ControlMessage, LifecycleEvent, LifecycleManager, LifecycleReply};
use crate::notify::{
  EventSource, HttpEventSource, LogSurface, NavigationIntent, NotificationScheduler,
  NotificationSurface, PushPayload, ScheduledNotification,
};
use crate::router::StrategyRouter;
use crate::sync::{DrainReport, SqliteQueueStorage, SyncQueue};

/// Exponential delay between automatic drains while replays keep failing.
#[derive(Debug, Clone)]
pub struct Backoff {
  base: Duration,
  max: Duration,
  failures: u32,
}

impl Backoff {
  pub fn new(base: Duration, max: Duration) -> Self {
    Self {
      base,
      max,
      failures: 0,
    }
  }

  pub fn delay(&self) -> Duration {
    let factor = 2u32.saturating_pow(self.failures.min(16));
    self.base.saturating_mul(factor).min(self.max)
  }

  /// Update from a drain result and return the delay before the next one.
  pub fn observe(&mut self, report: &DrainReport) -> Duration {
    if report.failed > 0 && report.succeeded == 0 {
      self.failures = self.failures.saturating_add(1);
    } else {
      self.failures = 0;
    }
    self.delay()
  }
}

/// When the next automatic check and drain are due.
struct Timers {
  next_check: Instant,
  next_drain: Instant,
  backoff: Backoff,
}

#[derive(Clone)]
pub struct Worker {
  config: Arc<Config>,
  router: Arc<StrategyRouter>,
  cache: Arc<CacheStore>,
  active: Arc<ActiveVersion>,
  queue: Arc<SyncQueue>,
  scheduler: Arc<NotificationScheduler>,
  events: Arc<dyn EventSource>,
  lifecycle: Arc<Mutex<LifecycleManager>>,
}

impl Worker {
  /// Build a worker backed by the on-disk database and the real network.
  pub fn new(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open(&config.data_dir()?)?);
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(config.network.timeout())?);
    let events = Arc::new(HttpEventSource::new(
      network.clone(),
      config.resolve(&config.notifications.events_url)?,
    ));
    Self::from_parts(config, db, network, Arc::new(LogSurface), events)
  }

  /// Build a worker from explicit collaborators.
  pub fn from_parts(
    config: Config,
    db: Arc<Database>,
    network: Arc<dyn Network>,
    surface: Arc<dyn NotificationSurface>,
    events: Arc<dyn EventSource>,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    let precache = config
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let cache = Arc::new(CacheStore::new(Arc::new(SqliteStorage::new(Arc::clone(&db)))));
    let active = Arc::new(ActiveVersion::new());
    let queue = Arc::new(
      SyncQueue::open(
        Arc::new(SqliteQueueStorage::new(Arc::clone(&db))),
        network.clone(),
        config.sync.max_attempts,
      )?
      .with_claim_lease(config.sync.claim_lease()),
    );
    let router = Arc::new(StrategyRouter::new(
      &origin,
      &config.routes,
      network.clone(),
      cache.clone(),
      active.clone(),
      queue.clone(),
    ));
    let scheduler = Arc::new(NotificationScheduler::new(
      surface,
      db,
      chrono::Duration::minutes(config.notifications.horizon_minutes),
    ));
    let lifecycle = LifecycleManager::new(
      CacheVersion::new(config.cache_version.clone()),
      precache,
      cache.clone(),
      network,
      active.clone(),
      queue.clone(),
    )
    .with_skip_waiting(config.skip_waiting);

    Ok(Self {
      config: Arc::new(config),
      router,
      cache,
      active,
      queue,
      scheduler,
      events,
      lifecycle: Arc::new(Mutex::new(lifecycle)),
    })
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub async fn install(&self) -> Result<LifecycleReply> {
    self.lifecycle.lock().await.handle(LifecycleEvent::Install).await
  }

  pub async fn activate(&self) -> Result<LifecycleReply> {
    self
      .lifecycle
      .lock()
      .await
      .handle(LifecycleEvent::Activate)
      .await
  }

  /// Install, then activate unless install already did.
  pub async fn start(&self) -> Result<()> {
    self.install().await?;
    self.activate().await?;
    Ok(())
  }

  /// Answer an intercepted request. Always resolves.
  pub async fn intercept(&self, request: Request) -> Response {
    self.router.handle(request).await
  }

  /// Drop the cached response for one request from the controlling version.
  /// Returns whether an entry was removed.
  pub async fn evict(&self, request: &Request) -> bool {
    let Some(handle) = self.active.current() else {
      debug!(url = %request.url, "No active cache to evict from");
      return false;
    };
    let key = RequestKey::from_request(request);
    let removed = self.cache.delete(&handle, &key).await;
    if removed {
      info!(key = %key, version = %handle.version(), "Evicted cached response");
    }
    removed
  }

  /// Run one drain if `tag` is the sync tag; other tags are ignored.
  pub async fn background_sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    if tag != self.config.sync.tag {
      debug!(tag, "Ignoring background sync tag");
      return Ok(None);
    }
    let report = self.queue.drain_once().await?;
    info!(
      succeeded = report.succeeded,
      failed = report.failed,
      remaining = report.remaining,
      "Background sync finished"
    );
    Ok(Some(report))
  }

  /// Run one scan + dispatch cycle if `tag` is the periodic tag. Returns the
  /// notifications dispatched.
  pub async fn periodic_sync(&self, tag: &str) -> Result<Option<Vec<ScheduledNotification>>> {
    if tag != self.config.notifications.tag {
      debug!(tag, "Ignoring periodic sync tag");
      return Ok(None);
    }

    let now = Utc::now();
    let retention = chrono::Duration::days(self.config.notifications.retention_days);
    self.scheduler.prune_displayed(now - retention)?;

    let events = self.events.upcoming().await?;
    let due = self.scheduler.scan_upcoming(&events, now)?;
    for notification in &due {
      self.scheduler.dispatch(notification)?;
    }
    Ok(Some(due))
  }

  /// Show a push notification; missing fields get defaults.
  pub fn push(&self, data: &[u8]) -> Result<ScheduledNotification> {
    let notification = self.scheduler.on_push(PushPayload::parse(data));
    self.scheduler.dispatch(&notification)?;
    Ok(notification)
  }

  pub fn notification_click(&self, action: &str, data: &Value) -> Option<NavigationIntent> {
    let intent = self.scheduler.on_click(action, data);
    if let Some(intent) = &intent {
      info!(url = %intent.url, "Navigation requested");
    }
    intent
  }

  /// Handle a control message and return its acknowledgement.
  pub async fn message(&self, message: &Value) -> Result<Value> {
    let reply = self
      .lifecycle
      .lock()
      .await
      .handle(LifecycleEvent::Message(ControlMessage::parse(message)))
      .await?;
    Ok(reply.to_ack())
  }

  /// Process host events until the queue closes or `Shutdown` arrives.
  /// Fetches run as independent tasks; everything else runs one at a time.
  pub async fn run(&self, mut events: EventHandler) -> Result<()> {
    let mut timers = Timers {
      next_check: Instant::now(),
      next_drain: Instant::now(),
      backoff: Backoff::new(
        Duration::from_secs(self.config.sync.backoff_base_secs),
        Duration::from_secs(self.config.sync.backoff_max_secs),
      ),
    };

    info!("Worker running");
    while let Some(event) = events.next().await {
      match event {
        HostEvent::Install => log_result("install", self.install().await),
        HostEvent::Activate => log_result("activate", self.activate().await),
        HostEvent::Fetch { request, reply } => {
          let router = Arc::clone(&self.router);
          tokio::spawn(async move {
            let response = router.handle(request).await;
            let _ = reply.send(response);
          });
        }
        HostEvent::BackgroundSync(tag) => {
          log_result("background sync", self.background_sync(&tag).await)
        }
        HostEvent::PeriodicSync(tag) => {
          log_result("periodic sync", self.periodic_sync(&tag).await)
        }
        HostEvent::Push(data) => log_result("push", self.push(&data)),
        HostEvent::NotificationClick {
          action,
          data,
          reply,
        } => {
          let intent = self.notification_click(&action, &data);
          if let Some(reply) = reply {
            let _ = reply.send(intent);
          }
        }
        HostEvent::Message { message, reply } => {
          let ack = match self.message(&message).await {
            Ok(ack) => ack,
            Err(e) => {
              error!(error = %e, "Control message failed");
              serde_json::json!({ "type": "ERROR", "error": e.to_string() })
            }
          };
          if let Some(reply) = reply {
            let _ = reply.send(ack);
          }
        }
        HostEvent::Tick => self.on_tick(&mut timers).await,
        HostEvent::Shutdown => break,
      }
    }
    info!("Worker stopped");
    Ok(())
  }

  async fn on_tick(&self, timers: &mut Timers) {
    let now = Instant::now();

    if now >= timers.next_check {
      let tag = self.config.notifications.tag.clone();
      log_result("periodic sync", self.periodic_sync(&tag).await);
      timers.next_check = now + Duration::from_secs(self.config.notifications.poll_interval_secs);
    }

    if now >= timers.next_drain {
      match self.queue.pending_count() {
        Ok(0) => timers.next_drain = now + timers.backoff.delay(),
        Ok(_) => {
          let tag = self.config.sync.tag.clone();
          match self.background_sync(&tag).await {
            Ok(Some(report)) => timers.next_drain = now + timers.backoff.observe(&report),
            Ok(None) => {}
            Err(e) => {
              warn!(error = %e, "Automatic drain failed");
              timers.next_drain = now + timers.backoff.delay();
            }
          }
        }
        Err(e) => warn!(error = %e, "Failed to inspect sync queue"),
      }
    }
  }
}

fn log_result<T>(what: &str, result: Result<T>) {
  if let Err(e) = result {
    error!(error = %e, "{} failed", what);
  }
}
