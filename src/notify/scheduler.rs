use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::surface::NotificationSurface;
use super::types::{NavigationIntent, PushPayload, ScheduledNotification, UpcomingEvent};
use crate::cache::format_datetime;
use crate::db::Database;

const DEFAULT_TITLE: &str = "MedSync";
const DEFAULT_URL: &str = "/";

/// Turns push payloads and upcoming appointments into notifications and hands
/// them to the display surface.
pub struct NotificationScheduler {
  surface: Arc<dyn NotificationSurface>,
  db: Arc<Database>,
  horizon: Duration,
}

impl NotificationScheduler {
  pub fn new(surface: Arc<dyn NotificationSurface>, db: Arc<Database>, horizon: Duration) -> Self {
    Self {
      surface,
      db,
      horizon,
    }
  }

  /// Build an immediately displayable notification from a push payload.
  /// Missing fields get defaults.
  pub fn on_push(&self, payload: PushPayload) -> ScheduledNotification {
    let id = Uuid::new_v4().to_string();
    ScheduledNotification {
      tag: payload.tag.unwrap_or_else(|| format!("push-{}", id)),
      id,
      title: payload.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
      body: payload.body.unwrap_or_default(),
      trigger_at: Some(Utc::now()),
      require_ack: payload.require_interaction,
      url: payload.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
    }
  }

  /// Reminders for events starting within `[now, now + horizon]` that have
  /// not been shown yet.
  pub fn scan_upcoming(
    &self,
    events: &[UpcomingEvent],
    now: DateTime<Utc>,
  ) -> Result<Vec<ScheduledNotification>> {
    let window_end = now + self.horizon;
    let mut seen = HashSet::new();
    let mut due = Vec::new();

    for event in events {
      if event.starts_at < now || event.starts_at > window_end {
        continue;
      }
      let tag = format!("appointment-{}", event.id);
      if !seen.insert(tag.clone()) || self.was_displayed(&tag)? {
        continue;
      }

      due.push(ScheduledNotification {
        id: Uuid::new_v4().to_string(),
        title: "Upcoming appointment".to_string(),
        body: format!("{} at {}", event.title, event.starts_at.format("%H:%M")),
        tag,
        trigger_at: Some(now),
        require_ack: true,
        url: event
          .url
          .clone()
          .unwrap_or_else(|| format!("/appointments/{}", event.id)),
      });
    }

    debug!(events = events.len(), due = due.len(), "Scanned upcoming events");
    Ok(due)
  }

  /// Show a notification and remember its tag.
  pub fn dispatch(&self, notification: &ScheduledNotification) -> Result<()> {
    self.surface.show(notification)?;
    self.record_displayed(&notification.tag)?;
    info!(tag = %notification.tag, "Dispatched notification");
    Ok(())
  }

  /// Resolve a click. Only the "view" action navigates.
  pub fn on_click(&self, action: &str, data: &Value) -> Option<NavigationIntent> {
    if action != "view" {
      return None;
    }
    let url = data
      .get("url")
      .and_then(Value::as_str)
      .filter(|s| !s.is_empty())
      .unwrap_or(DEFAULT_URL);
    Some(NavigationIntent {
      url: url.to_string(),
    })
  }

  /// Forget tags displayed before `before`; returns how many were dropped.
  pub fn prune_displayed(&self, before: DateTime<Utc>) -> Result<usize> {
    let conn = self.db.conn()?;
    let pruned = conn
      .execute(
        "DELETE FROM displayed_notifications WHERE displayed_at < ?",
        params![format_datetime(&before)],
      )
      .map_err(|e| eyre!("Failed to prune displayed notifications: {}", e))?;
    Ok(pruned)
  }

  fn was_displayed(&self, tag: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM displayed_notifications WHERE tag = ?",
        params![tag],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to query displayed notifications: {}", e))?;
    Ok(count > 0)
  }

  fn record_displayed(&self, tag: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO displayed_notifications (tag, displayed_at) VALUES (?, ?)",
        params![tag, format_datetime(&Utc::now())],
      )
      .map_err(|e| eyre!("Failed to record displayed notification: {}", e))?;
    Ok(())
  }
}
