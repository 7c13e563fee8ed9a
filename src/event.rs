use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::http::{Request, Response};
use crate::notify::NavigationIntent;

/// Events delivered by the host runtime
#[derive(Debug)]
pub enum HostEvent {
  Install,
  Activate,
  /// Intercepted request; the response goes back on `reply`
  Fetch {
    request: Request,
    reply: oneshot::Sender<Response>,
  },
  BackgroundSync(String),
  PeriodicSync(String),
  /// Raw push data
  Push(Vec<u8>),
  /// Notification action; the navigation intent, if any, goes back on `reply`
  NotificationClick {
    action: String,
    data: Value,
    reply: Option<oneshot::Sender<Option<NavigationIntent>>>,
  },
  /// Control message `{ "type": ... }`, acknowledged on `reply` if present
  Message {
    message: Value,
    reply: Option<oneshot::Sender<Value>>,
  },
  /// Periodic tick for scheduled syncs and checks
  Tick,
  Shutdown,
}

/// Event queue fed by the host and a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<HostEvent>,
  rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(tick_rate);
      loop {
        ticker.tick().await;
        if tick_tx.send(HostEvent::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for posting events into the queue
  pub fn sender(&self) -> mpsc::UnboundedSender<HostEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<HostEvent> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_ticks_and_posted_events_arrive() {
    let mut events = EventHandler::new(Duration::from_millis(5));
    events
      .sender()
      .send(HostEvent::BackgroundSync("sync-appointments".to_string()))
      .unwrap();

    let mut saw_sync = false;
    let mut saw_tick = false;
    while !(saw_sync && saw_tick) {
      match events.next().await {
        Some(HostEvent::BackgroundSync(tag)) => {
          assert_eq!(tag, "sync-appointments");
          saw_sync = true;
        }
        Some(HostEvent::Tick) => saw_tick = true,
        other => panic!("unexpected event {:?}", other),
      }
    }
  }
}
