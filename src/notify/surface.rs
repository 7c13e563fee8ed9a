use color_eyre::Result;
use tracing::info;

use super::types::ScheduledNotification;

/// The host's notification display.
pub trait NotificationSurface: Send + Sync {
  fn show(&self, notification: &ScheduledNotification) -> Result<()>;
}

/// Surface that writes notifications to the log.
pub struct LogSurface;

impl NotificationSurface for LogSurface {
  fn show(&self, notification: &ScheduledNotification) -> Result<()> {
    info!(
      id = %notification.id,
      tag = %notification.tag,
      title = %notification.title,
      body = %notification.body,
      url = %notification.url,
      require_ack = notification.require_ack,
      "Notification"
    );
    Ok(())
  }
}
