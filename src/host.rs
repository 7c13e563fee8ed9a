//! Line-delimited JSON bridge for an embedding host.
//!
//! Each stdin line is one event, e.g.
//! `{"id": 7, "event": "fetch", "url": "/api/doctors"}`. Events that answer
//! (fetch, message, notification-click) print one stdout line
//! `{"id": 7, "reply": ...}` when done.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;

use crate::event::HostEvent;
use crate::http::{Request, Response};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum HostCommand {
  Install,
  Activate,
  Fetch {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
  },
  BackgroundSync {
    tag: String,
  },
  PeriodicSync {
    tag: String,
  },
  /// `data` is the raw push body: a string is sent as is, anything else as JSON
  Push {
    #[serde(default)]
    data: Value,
  },
  NotificationClick {
    action: String,
    #[serde(default)]
    data: Value,
  },
  Message {
    message: Value,
  },
  Shutdown,
}

fn default_method() -> String {
  "GET".to_string()
}

type PendingReply = BoxFuture<'static, Option<Value>>;

/// One decoded input line.
struct Decoded {
  id: Value,
  event: HostEvent,
  reply: Option<PendingReply>,
}

/// Read events from stdin until EOF and post them to `tx`. Malformed lines
/// are logged and skipped.
pub fn spawn_stdin_feed(origin: Url, tx: mpsc::UnboundedSender<HostEvent>) {
  tokio::spawn(async move {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
      match lines.next_line().await {
        Ok(Some(line)) if line.trim().is_empty() => continue,
        Ok(Some(line)) => {
          if !forward(&line, &origin, &tx) {
            break;
          }
        }
        Ok(None) => {
          debug!("Host input closed");
          break;
        }
        Err(e) => {
          warn!(error = %e, "Failed to read host input");
          break;
        }
      }
    }
  });
}

/// Returns false once the worker stopped listening.
fn forward(line: &str, origin: &Url, tx: &mpsc::UnboundedSender<HostEvent>) -> bool {
  let Decoded { id, event, reply } = match decode(line, origin) {
    Ok(decoded) => decoded,
    Err(e) => {
      warn!(error = %e, "Ignoring malformed host event");
      return true;
    }
  };

  if tx.send(event).is_err() {
    return false;
  }
  if let Some(reply) = reply {
    tokio::spawn(async move {
      let reply = reply.await.unwrap_or(Value::Null);
      println!("{}", serde_json::json!({ "id": id, "reply": reply }));
    });
  }
  true
}

fn decode(line: &str, origin: &Url) -> Result<Decoded> {
  let value: Value = serde_json::from_str(line).map_err(|e| eyre!("Invalid JSON: {}", e))?;
  let id = value.get("id").cloned().unwrap_or(Value::Null);
  let command: HostCommand =
    serde_json::from_value(value).map_err(|e| eyre!("Invalid event: {}", e))?;

  let (event, reply) = match command {
    HostCommand::Install => (HostEvent::Install, None),
    HostCommand::Activate => (HostEvent::Activate, None),
    HostCommand::Fetch {
      url,
      method,
      headers,
      body,
    } => {
      let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let url = origin
        .join(&url)
        .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
      let mut request = Request::new(method, url);
      for (name, value) in &headers {
        request = request.with_header(name, value);
      }
      if let Some(body) = body {
        request = request.with_body(body.into_bytes());
      }

      let (tx, rx) = oneshot::channel();
      let reply = async move { rx.await.ok().map(|response| response_json(&response)) }.boxed();
      (
        HostEvent::Fetch {
          request,
          reply: tx,
        },
        Some(reply),
      )
    }
    HostCommand::BackgroundSync { tag } => (HostEvent::BackgroundSync(tag), None),
    HostCommand::PeriodicSync { tag } => (HostEvent::PeriodicSync(tag), None),
    HostCommand::Push { data } => {
      let bytes = match data {
        Value::Null => Vec::new(),
        Value::String(text) => text.into_bytes(),
        other => other.to_string().into_bytes(),
      };
      (HostEvent::Push(bytes), None)
    }
    HostCommand::NotificationClick { action, data } => {
      let (tx, rx) = oneshot::channel();
      let reply = async move {
        let intent = rx.await.ok().flatten();
        serde_json::to_value(intent).ok()
      }
      .boxed();
      (
        HostEvent::NotificationClick {
          action,
          data,
          reply: Some(tx),
        },
        Some(reply),
      )
    }
    HostCommand::Message { message } => {
      let (tx, rx) = oneshot::channel();
      let reply = async move { rx.await.ok() }.boxed();
      (
        HostEvent::Message {
          message,
          reply: Some(tx),
        },
        Some(reply),
      )
    }
    HostCommand::Shutdown => (HostEvent::Shutdown, None),
  };

  Ok(Decoded { id, event, reply })
}

fn response_json(response: &Response) -> Value {
  serde_json::json!({
    "status": response.status,
    "headers": response.headers,
    "body": String::from_utf8_lossy(&response.body),
    "source": format!("{:?}", response.source).to_lowercase(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notify::NavigationIntent;

  fn origin() -> Url {
    Url::parse("https://app.test").unwrap()
  }

  #[tokio::test]
  async fn test_fetch_line_resolves_and_replies() {
    let decoded = decode(
      r#"{"id":7,"event":"fetch","url":"/api/appointments","method":"post","headers":{"Content-Type":"application/json"},"body":"{}"}"#,
      &origin(),
    )
    .unwrap();
    assert_eq!(decoded.id, 7);

    let HostEvent::Fetch { request, reply } = decoded.event else {
      panic!("expected fetch");
    };
    assert_eq!(request.method, reqwest::Method::POST);
    assert_eq!(request.url.as_str(), "https://app.test/api/appointments");
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.body, b"{}");

    reply.send(Response::queued(uuid::Uuid::new_v4())).unwrap();
    let json = decoded.reply.unwrap().await.unwrap();
    assert_eq!(json["status"], 202);
    assert_eq!(json["source"], "queued");
  }

  #[tokio::test]
  async fn test_click_line_replies_with_intent() {
    let decoded = decode(
      r#"{"id":"c1","event":"notification-click","action":"view","data":{"url":"/appointments/9"}}"#,
      &origin(),
    )
    .unwrap();
    let HostEvent::NotificationClick {
      action,
      data,
      reply,
    } = decoded.event
    else {
      panic!("expected click");
    };
    assert_eq!(action, "view");
    assert_eq!(data["url"], "/appointments/9");

    reply
      .unwrap()
      .send(Some(NavigationIntent {
        url: "/appointments/9".to_string(),
      }))
      .unwrap();
    let json = decoded.reply.unwrap().await.unwrap();
    assert_eq!(json["url"], "/appointments/9");
  }

  #[test]
  fn test_simple_events_decode() {
    let sync = decode(
      r#"{"event":"background-sync","tag":"sync-appointments"}"#,
      &origin(),
    )
    .unwrap();
    assert!(matches!(sync.event, HostEvent::BackgroundSync(ref tag) if tag == "sync-appointments"));
    assert!(sync.reply.is_none());
    assert!(sync.id.is_null());

    let push = decode(r#"{"event":"push","data":{"title":"Hi"}}"#, &origin()).unwrap();
    let HostEvent::Push(bytes) = push.event else {
      panic!("expected push");
    };
    assert_eq!(
      serde_json::from_slice::<Value>(&bytes).unwrap()["title"],
      "Hi"
    );

    let message = decode(
      r#"{"id":1,"event":"message","message":{"type":"SKIP_WAITING"}}"#,
      &origin(),
    )
    .unwrap();
    assert!(matches!(message.event, HostEvent::Message { reply: Some(_), .. }));

    assert!(matches!(
      decode(r#"{"event":"shutdown"}"#, &origin()).unwrap().event,
      HostEvent::Shutdown
    ));
  }

  #[test]
  fn test_malformed_lines_are_rejected() {
    assert!(decode("not json", &origin()).is_err());
    assert!(decode(r#"{"event":"reboot"}"#, &origin()).is_err());
    assert!(decode(r#"{"event":"fetch"}"#, &origin()).is_err());
  }
}
