//! Core types for the versioned cache.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::key::RequestKey;
use crate::http::{Response, ResponseSource};

/// Identifies one generation of the cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheVersion(String);

impl CacheVersion {
  pub fn new(version: impl Into<String>) -> Self {
    Self(version.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for CacheVersion {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

/// A stored response. Replaced wholesale on every write, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_response(key: RequestKey, response: &Response) -> Self {
    Self {
      key,
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn into_response(self, source: ResponseSource) -> Response {
    Response {
      status: self.status,
      headers: self.headers,
      body: self.body,
      source,
    }
  }
}

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("Refusing to cache {key}: status {status} is not a success")]
  Uncacheable { key: String, status: u16 },

  #[error("Cache storage failure: {0}")]
  Storage(String),
}

impl From<color_eyre::Report> for CacheError {
  fn from(e: color_eyre::Report) -> Self {
    CacheError::Storage(e.to_string())
  }
}
