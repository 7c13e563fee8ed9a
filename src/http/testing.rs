//! Scripted network used by unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Network, NetworkError, Request, Response};

/// Serves canned responses by URL path; unknown paths answer 404.
pub struct ScriptedNetwork {
  online: AtomicBool,
  routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
  requests: Mutex<Vec<Request>>,
  calls: AtomicUsize,
  delay: Duration,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      requests: Mutex::new(Vec::new()),
      calls: AtomicUsize::new(0),
      delay: Duration::ZERO,
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn route(&self, path: &str, status: u16, body: &[u8]) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), (status, body.to_vec()));
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Number of fetches attempted, online or not.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn calls_to(&self, path: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.path() == path)
      .count()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.requests.lock().unwrap().push(request.clone());

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if !self.online.load(Ordering::SeqCst) {
      return Err(NetworkError::Connect("network is down".to_string()));
    }

    let route = self.routes.lock().unwrap().get(request.url.path()).cloned();
    Ok(match route {
      Some((status, body)) => Response::new(status, body),
      None => Response::new(404, b"not found".to_vec()),
    })
  }
}
