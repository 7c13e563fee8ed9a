use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

use crate::http::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  Replaying,
  Succeeded,
  Failed,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Replaying => "replaying",
      TaskStatus::Succeeded => "succeeded",
      TaskStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(TaskStatus::Pending),
      "replaying" => Ok(TaskStatus::Replaying),
      "succeeded" => Ok(TaskStatus::Succeeded),
      "failed" => Ok(TaskStatus::Failed),
      other => Err(eyre!("Unknown task status '{}'", other)),
    }
  }
}

/// Verbatim copy of a request taken when it was queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
  pub method: String,
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl RequestSnapshot {
  pub fn capture(request: &Request) -> Self {
    Self {
      method: request.method.as_str().to_string(),
      url: request.url.to_string(),
      headers: request.headers.clone(),
      body: request.body.clone(),
    }
  }

  /// Rebuild a request for replay.
  pub fn to_request(&self) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", self.method, e))?;
    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid URL '{}': {}", self.url, e))?;

    Ok(Request {
      method,
      url,
      headers: self.headers.clone(),
      body: self.body.clone(),
    })
  }
}

/// A queued mutation awaiting replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
  pub id: Uuid,
  pub snapshot: RequestSnapshot,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub max_attempts: u32,
  pub status: TaskStatus,
  /// Why the last replay did not succeed
  pub last_error: Option<String>,
}

impl SyncTask {
  pub fn new(snapshot: RequestSnapshot, max_attempts: u32) -> Self {
    Self {
      id: Uuid::new_v4(),
      snapshot,
      created_at: Utc::now(),
      attempts: 0,
      max_attempts: max_attempts.max(1),
      status: TaskStatus::Pending,
      last_error: None,
    }
  }

  /// Record a failed replay: back to Pending, or Failed once attempts run out.
  pub fn record_failure(&mut self, error: impl Into<String>) {
    self.attempts += 1;
    self.last_error = Some(error.into());
    self.status = if self.attempts >= self.max_attempts {
      TaskStatus::Failed
    } else {
      TaskStatus::Pending
    };
  }

  /// Record a failure that retrying cannot fix.
  pub fn record_permanent_failure(&mut self, error: impl Into<String>) {
    self.attempts += 1;
    self.last_error = Some(error.into());
    self.status = TaskStatus::Failed;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn snapshot() -> RequestSnapshot {
    RequestSnapshot {
      method: "POST".to_string(),
      url: "https://app.test/api/appointments".to_string(),
      headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
      body: br#"{"doctor":7}"#.to_vec(),
    }
  }

  #[test]
  fn test_failure_lifecycle() {
    let mut task = SyncTask::new(snapshot(), 3);
    task.record_failure("offline");
    assert_eq!(task.status, TaskStatus::Pending);
    task.record_failure("offline");
    assert_eq!(task.status, TaskStatus::Pending);
    task.record_failure("offline");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.last_error.as_deref(), Some("offline"));
  }

  #[test]
  fn test_snapshot_rebuilds_request() {
    let request = snapshot().to_request().unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.url.path(), "/api/appointments");
    assert_eq!(request.header("Content-Type"), Some("application/json"));
    assert_eq!(request.body, br#"{"doctor":7}"#);
  }

  #[test]
  fn test_status_parse() {
    for status in [
      TaskStatus::Pending,
      TaskStatus::Replaying,
      TaskStatus::Succeeded,
      TaskStatus::Failed,
    ] {
      assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
    }
    assert!("done".parse::<TaskStatus>().is_err());
  }
}
