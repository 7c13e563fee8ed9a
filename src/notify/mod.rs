//! Notification scheduling: push payloads, appointment reminders and clicks.

mod scheduler;
mod source;
mod surface;
mod types;

pub use scheduler::NotificationScheduler;
pub use source::{EventSource, HttpEventSource};
pub use surface::{LogSurface, NotificationSurface};
#[cfg(test)]
pub use surface::testing::RecordingSurface;
pub use types::{NavigationIntent, PushPayload, ScheduledNotification, UpcomingEvent};
