use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// Header carrying the client-generated request id that replay targets use to
/// deduplicate mutations.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// An intercepted request. Header names are stored lowercased.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  /// Plain reads are the only requests ever answered from cache.
  pub fn is_read(&self) -> bool {
    self.method == Method::GET
  }

  /// Anything that is not a pure read (GET, HEAD, OPTIONS, TRACE).
  pub fn is_mutating(&self) -> bool {
    !matches!(
      self.method,
      Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
  }

  /// Return the request's idempotency key, generating one if it has none.
  pub fn ensure_idempotency_key(&mut self) -> String {
    self
      .headers
      .entry(IDEMPOTENCY_HEADER.to_string())
      .or_insert_with(|| uuid::Uuid::new_v4().to_string())
      .clone()
  }
}

/// Where a response handed back to the application came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Cache hit, network not consulted
  Cache,
  /// Network failed, serving the cached copy
  Offline,
  /// Mutation accepted into the sync queue
  Queued,
  /// Built locally because nothing else was available
  Synthesized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  #[allow(dead_code)]
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
      source: ResponseSource::Network,
    }
  }

  /// A locally built JSON response.
  pub fn json(status: u16, value: &Value, source: ResponseSource) -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self {
      status,
      headers,
      body: value.to_string().into_bytes(),
      source,
    }
  }

  /// Structured offline answer used whenever neither network nor cache can
  /// serve a request.
  pub fn unavailable() -> Self {
    Self::json(
      503,
      &serde_json::json!({ "error": "unavailable" }),
      ResponseSource::Synthesized,
    )
  }

  /// Answer for a mutation that was parked in the sync queue.
  pub fn queued(task_id: uuid::Uuid) -> Self {
    Self::json(
      202,
      &serde_json::json!({ "queued": true, "taskId": task_id }),
      ResponseSource::Queued,
    )
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_client_error(&self) -> bool {
    (400..500).contains(&self.status)
  }

  #[allow(dead_code)]
  pub fn body_json(&self) -> Option<Value> {
    serde_json::from_slice(&self.body).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_mutating_methods() {
    assert!(!Request::get(url("https://app.test/api/x")).is_mutating());
    assert!(!Request::new(Method::HEAD, url("https://app.test/")).is_mutating());
    for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
      assert!(Request::new(method, url("https://app.test/api/x")).is_mutating());
    }
  }

  #[test]
  fn test_ensure_idempotency_key_keeps_existing() {
    let mut req = Request::new(Method::POST, url("https://app.test/api/appointments"))
      .with_header("Idempotency-Key", "abc");
    assert_eq!(req.ensure_idempotency_key(), "abc");

    let mut fresh = Request::new(Method::POST, url("https://app.test/api/appointments"));
    let generated = fresh.ensure_idempotency_key();
    assert_eq!(fresh.header("Idempotency-Key"), Some(generated.as_str()));
  }

  #[test]
  fn test_unavailable_is_machine_readable() {
    let resp = Response::unavailable();
    assert_eq!(resp.status, 503);
    assert_eq!(resp.body_json().unwrap()["error"], "unavailable");
  }
}
