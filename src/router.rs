//! Per-request strategy selection between cache and network.

use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, error, warn};
use url::{Origin, Url};

use crate::cache::{ActiveVersion, CacheEntry, CacheError, CacheHandle, CacheStore, RequestKey};
use crate::config::{RouteRule, RoutesConfig, Strategy};
use crate::http::{Network, Request, Response, ResponseSource};
use crate::sync::{RequestSnapshot, SyncQueue};

/// Routes every intercepted request through exactly one strategy.
pub struct StrategyRouter {
  origin: Origin,
  /// Bypass prefixes first, then configured rules, in declaration order
  rules: Vec<RouteRule>,
  default: Strategy,
  network: Arc<dyn Network>,
  cache: Arc<CacheStore>,
  active: Arc<ActiveVersion>,
  queue: Arc<SyncQueue>,
}

impl StrategyRouter {
  pub fn new(
    origin: &Url,
    routes: &RoutesConfig,
    network: Arc<dyn Network>,
    cache: Arc<CacheStore>,
    active: Arc<ActiveVersion>,
    queue: Arc<SyncQueue>,
  ) -> Self {
    let rules = routes
      .bypass
      .iter()
      .map(|prefix| RouteRule {
        prefix: prefix.clone(),
        strategy: Strategy::Bypass,
      })
      .chain(routes.rules.iter().cloned())
      .collect();

    Self {
      origin: origin.origin(),
      rules,
      default: routes.default,
      network,
      cache,
      active,
      queue,
    }
  }

  /// Pick the strategy for a request: cross-origin always bypasses, then the
  /// longest matching prefix wins, ties going to the earlier rule.
  pub fn classify(&self, request: &Request) -> Strategy {
    if request.url.origin() != self.origin {
      return Strategy::Bypass;
    }

    let path = request.url.path();
    self
      .rules
      .iter()
      .enumerate()
      .filter(|(_, rule)| path.starts_with(&rule.prefix))
      .min_by_key(|(index, rule)| (Reverse(rule.prefix.len()), *index))
      .map(|(_, rule)| rule.strategy)
      .unwrap_or(self.default)
  }

  /// Answer a request. Never fails: the worst case is a structured 503.
  pub async fn handle(&self, mut request: Request) -> Response {
    let strategy = self.classify(&request);
    debug!(method = %request.method, url = %request.url, ?strategy, "Intercepted request");

    if strategy == Strategy::Bypass {
      return self.pass_through(&request).await;
    }

    // Pinned for the whole request, even if a new version activates meanwhile.
    let Some(handle) = self.active.current() else {
      return self.pass_through(&request).await;
    };

    if request.is_mutating() {
      request.ensure_idempotency_key();
      return self.mutate(request).await;
    }
    if !request.is_read() {
      return self.pass_through(&request).await;
    }

    match strategy {
      Strategy::NetworkFirst => self.network_first(&handle, &request).await,
      Strategy::CacheFirst => self.cache_first(&handle, &request).await,
      Strategy::Bypass => self.pass_through(&request).await,
    }
  }

  async fn network_first(&self, handle: &CacheHandle, request: &Request) -> Response {
    let key = RequestKey::from_request(request);

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(handle, key, &response).await;
        }
        response
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed, falling back to cache");
        match self.cache.get(handle, &key) {
          Some(entry) => entry.into_response(ResponseSource::Offline),
          None => Response::unavailable(),
        }
      }
    }
  }

  async fn cache_first(&self, handle: &CacheHandle, request: &Request) -> Response {
    let key = RequestKey::from_request(request);

    if let Some(entry) = self.cache.get(handle, &key) {
      return entry.into_response(ResponseSource::Cache);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(handle, key, &response).await;
        }
        response
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed on cache miss");
        Response::unavailable()
      }
    }
  }

  /// Mutations go to the network; on connectivity failure they are parked in
  /// the sync queue. Any response, including 4xx, is passed through as is.
  async fn mutate(&self, request: Request) -> Response {
    match self.network.fetch(&request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(method = %request.method, url = %request.url, error = %e, "Mutation failed offline");
        match self.queue.enqueue(RequestSnapshot::capture(&request)) {
          Ok(task) => Response::queued(task.id),
          Err(e) => {
            error!(url = %request.url, error = %e, "Failed to queue mutation");
            Response::unavailable()
          }
        }
      }
    }
  }

  async fn pass_through(&self, request: &Request) -> Response {
    match self.network.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %request.url, error = %e, "Pass-through request failed");
        Response::unavailable()
      }
    }
  }

  /// Cache a response; failures are logged and otherwise ignored.
  async fn store(&self, handle: &CacheHandle, key: RequestKey, response: &Response) {
    let entry = CacheEntry::from_response(key, response);
    match self.cache.put(handle, entry).await {
      Ok(()) => {}
      Err(e @ CacheError::Uncacheable { .. }) => debug!(error = %e, "Response not cached"),
      Err(e) => warn!(error = %e, "Failed to cache response"),
    }
  }
}
