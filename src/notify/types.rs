use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user-visible alert ready for the host's notification surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledNotification {
  pub id: String,
  pub title: String,
  pub body: String,
  /// Collapses repeated alerts for the same source event
  pub tag: String,
  pub trigger_at: Option<DateTime<Utc>>,
  pub require_ack: bool,
  /// Opened when the user chooses "view"
  pub url: String,
}

/// Inbound push payload. Every field is optional on the wire.
#[derive(Debug, Clone, Default)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
  pub tag: Option<String>,
  pub require_interaction: bool,
}

impl PushPayload {
  /// Parse raw push data, falling back to an empty payload when it is not
  /// valid JSON.
  pub fn parse(data: &[u8]) -> Self {
    if data.is_empty() {
      return Self::default();
    }
    match serde_json::from_slice::<Value>(data) {
      Ok(value) => Self::from_value(&value),
      Err(_) => Self {
        body: Some(String::from_utf8_lossy(data).into_owned()),
        ..Self::default()
      },
    }
  }

  /// Field-by-field extraction so one malformed field does not discard the rest.
  fn from_value(value: &Value) -> Self {
    let text = |name: &str| {
      value
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
    };
    Self {
      title: text("title"),
      body: text("body"),
      url: text("url"),
      tag: text("tag"),
      require_interaction: value
        .get("requireInteraction")
        .and_then(Value::as_bool)
        .unwrap_or(false),
    }
  }
}

/// A domain event (an appointment) that may warrant a reminder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingEvent {
  pub id: String,
  pub title: String,
  pub starts_at: DateTime<Utc>,
  #[serde(default)]
  pub url: Option<String>,
}

/// Request for the host to open a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationIntent {
  pub url: String,
}
