//! Canonical request identity used for cache lookups and write serialization.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::http::Request;

/// Request headers that select between distinct cached representations.
const VARY_HEADERS: &[&str] = &["accept", "accept-language"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
  pub vary: BTreeMap<String, String>,
}

impl RequestKey {
  pub fn from_request(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);

    let vary = VARY_HEADERS
      .iter()
      .filter_map(|name| {
        request
          .header(name)
          .map(|v| (name.to_string(), v.trim().to_string()))
      })
      .collect();

    Self {
      method: request.method.as_str().to_uppercase(),
      url: url.to_string(),
      vary,
    }
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    for (name, value) in &self.vary {
      hasher.update(b"\n");
      hasher.update(name.as_bytes());
      hasher.update(b":");
      hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}
