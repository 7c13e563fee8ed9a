mod cache;
mod config;
mod db;
mod event;
mod host;
mod http;
mod lifecycle;
mod notify;
mod router;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::event::{EventHandler, HostEvent};
use crate::http::Request;
use crate::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "medsync")]
#[command(about = "Offline cache and background sync runtime for the appointment dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/medsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log informational messages to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the worker: periodic appointment checks, backed-off sync drains, and
  /// host events read as JSON lines from stdin
  Run,
  /// Send one request through the interception path
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Extra header, "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Replay queued mutations once
  Sync,
  /// Check upcoming appointments and show due reminders
  Check,
  /// Show the sync queue, including tasks that need attention
  Status,
  /// Re-queue a failed sync task
  Retry { id: uuid::Uuid },
  /// Discard a failed sync task
  Discard { id: uuid::Uuid },
  /// Show a notification from a push payload (JSON)
  Push { payload: String },
  /// Drop the current cache version
  ClearCache,
  /// Drop the cached response for one URL
  Evict {
    /// Absolute URL or path relative to the origin
    url: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config.data_dir()?.join("logs"), args.verbose)?;

  let worker = Worker::new(config.clone())?;

  match args.command {
    Command::Run => {
      worker.start().await?;
      let events = EventHandler::new(Duration::from_secs(1));
      host::spawn_stdin_feed(config.origin_url()?, events.sender());
      let tx = events.sender();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          let _ = tx.send(HostEvent::Shutdown);
        }
      });
      worker.run(events).await?;
    }
    Command::Fetch {
      url,
      method,
      data,
      headers,
    } => {
      worker.start().await?;
      let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request = Request::new(method, config.resolve(&url)?);
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(data) = data {
        request = request.with_body(data.into_bytes());
      }

      let response = worker.intercept(request).await;
      eprintln!("{} ({:?})", response.status, response.source);
      println!("{}", String::from_utf8_lossy(&response.body));
    }
    Command::Sync => {
      if let Some(report) = worker.background_sync(&config.sync.tag).await? {
        println!(
          "succeeded: {}  failed: {}  remaining: {}",
          report.succeeded, report.failed, report.remaining
        );
      }
    }
    Command::Check => {
      if let Some(shown) = worker.periodic_sync(&config.notifications.tag).await? {
        for notification in &shown {
          println!("{}: {} ({})", notification.title, notification.body, notification.url);
        }
        println!("{} reminder(s) shown", shown.len());
      }
    }
    Command::Status => {
      let queue = worker.queue();
      println!("pending: {}", queue.pending_count()?);
      println!("replaying: {}", queue.replaying_count()?);
      let failed = queue.failed_tasks()?;
      println!("failed: {}", failed.len());
      for task in failed {
        println!(
          "  {}  {} {}  attempts={}  {}",
          task.id,
          task.snapshot.method,
          task.snapshot.url,
          task.attempts,
          task.last_error.unwrap_or_default()
        );
      }
    }
    Command::Retry { id } => {
      if !worker.queue().retry_failed(id)? {
        return Err(eyre!("No failed sync task {}", id));
      }
      println!("re-queued {}", id);
    }
    Command::Discard { id } => {
      if !worker.queue().discard(id)? {
        return Err(eyre!("No failed sync task {}", id));
      }
      println!("discarded {}", id);
    }
    Command::Push { payload } => {
      let notification = worker.push(payload.as_bytes())?;
      println!("{}: {} ({})", notification.title, notification.body, notification.url);
    }
    Command::ClearCache => {
      worker.start().await?;
      let ack = worker
        .message(&serde_json::json!({ "type": "CLEAR_CACHE" }))
        .await?;
      println!("{}", ack);
    }
    Command::Evict { url } => {
      worker.start().await?;
      let request = Request::get(config.resolve(&url)?);
      if !worker.evict(&request).await {
        return Err(eyre!("No cached response for {}", request.url));
      }
      println!("evicted {}", request.url);
    }
  }

  Ok(())
}

/// Log to a daily file under `log_dir`, plus warnings (or everything with
/// `--verbose`) to stderr.
fn init_tracing(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "medsync.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr_level = if verbose {
    LevelFilter::INFO
  } else {
    LevelFilter::WARN
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(stderr_level),
    )
    .init();

  Ok(guard)
}
