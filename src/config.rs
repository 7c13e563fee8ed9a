use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the dashboard application; everything else is cross-origin
  pub origin: String,
  /// Name of the cache generation this build owns
  #[serde(default = "default_cache_version")]
  pub cache_version: String,
  /// Where the database and logs live (defaults to $XDG_DATA_HOME/medsync)
  pub data_dir: Option<PathBuf>,
  /// Activate straight after install instead of waiting for old instances
  #[serde(default)]
  pub skip_waiting: bool,
  /// Critical assets fetched into the cache during install
  #[serde(default)]
  pub precache: Vec<String>,
  #[serde(default)]
  pub routes: RoutesConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Network, falling back to cache when offline
  #[default]
  NetworkFirst,
  /// Cache, falling back to network on a miss
  CacheFirst,
  /// Straight to network, no caching side effects
  Bypass,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RouteRule {
  /// URL path prefix, e.g. "/api/"
  pub prefix: String,
  pub strategy: Strategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutesConfig {
  /// Strategy for same-origin requests no rule matches
  #[serde(default)]
  pub default: Strategy,
  #[serde(default = "default_rules")]
  pub rules: Vec<RouteRule>,
  /// Path prefixes that always bypass (update channel, dev tooling)
  #[serde(default = "default_bypass")]
  pub bypass: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      default: Strategy::default(),
      rules: default_rules(),
      bypass: default_bypass(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Background sync tag that triggers a drain
  #[serde(default = "default_sync_tag")]
  pub tag: String,
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// First delay between automatic drains after a failing one
  #[serde(default = "default_backoff_base_secs")]
  pub backoff_base_secs: u64,
  #[serde(default = "default_backoff_max_secs")]
  pub backoff_max_secs: u64,
  /// How long a drain may own a task before others treat it as abandoned
  #[serde(default = "default_claim_lease_secs")]
  pub claim_lease_secs: u64,
}

impl SyncConfig {
  pub fn claim_lease(&self) -> chrono::Duration {
    let secs = i64::try_from(self.claim_lease_secs).unwrap_or(i64::MAX);
    chrono::Duration::seconds(secs.min(i64::MAX / 1000))
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
      max_attempts: default_max_attempts(),
      backoff_base_secs: default_backoff_base_secs(),
      backoff_max_secs: default_backoff_max_secs(),
      claim_lease_secs: default_claim_lease_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
  /// Periodic sync tag that triggers an upcoming-appointments scan
  #[serde(default = "default_periodic_tag")]
  pub tag: String,
  /// Endpoint returning upcoming appointments, relative to the origin
  #[serde(default = "default_events_url")]
  pub events_url: String,
  #[serde(default = "default_horizon_minutes")]
  pub horizon_minutes: i64,
  #[serde(default = "default_poll_interval_secs")]
  pub poll_interval_secs: u64,
  /// How long a displayed tag suppresses repeats
  #[serde(default = "default_retention_days")]
  pub retention_days: i64,
}

impl Default for NotificationsConfig {
  fn default() -> Self {
    Self {
      tag: default_periodic_tag(),
      events_url: default_events_url(),
      horizon_minutes: default_horizon_minutes(),
      poll_interval_secs: default_poll_interval_secs(),
      retention_days: default_retention_days(),
    }
  }
}

fn default_cache_version() -> String {
  "medsync-v1".to_string()
}

fn default_rules() -> Vec<RouteRule> {
  vec![
    RouteRule {
      prefix: "/api/".to_string(),
      strategy: Strategy::NetworkFirst,
    },
    RouteRule {
      prefix: "/static/".to_string(),
      strategy: Strategy::CacheFirst,
    },
    RouteRule {
      prefix: "/assets/".to_string(),
      strategy: Strategy::CacheFirst,
    },
  ]
}

fn default_bypass() -> Vec<String> {
  vec![
    "/sw.js".to_string(),
    "/sockjs-node".to_string(),
    "/__".to_string(),
  ]
}

fn default_timeout_secs() -> u64 {
  15
}

fn default_sync_tag() -> String {
  "sync-appointments".to_string()
}

fn default_max_attempts() -> u32 {
  5
}

fn default_backoff_base_secs() -> u64 {
  30
}

fn default_backoff_max_secs() -> u64 {
  30 * 60
}

fn default_claim_lease_secs() -> u64 {
  5 * 60
}

fn default_periodic_tag() -> String {
  "check-appointments".to_string()
}

fn default_events_url() -> String {
  "/api/appointments/upcoming".to_string()
}

fn default_horizon_minutes() -> i64 {
  24 * 60
}

fn default_poll_interval_secs() -> u64 {
  15 * 60
}

fn default_retention_days() -> i64 {
  7
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./medsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/medsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/medsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("medsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("medsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.cache_version.trim().is_empty() {
      return Err(eyre!("cache_version must not be empty"));
    }
    if self.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    if self.sync.claim_lease_secs <= self.network.timeout_secs {
      return Err(eyre!(
        "sync.claim_lease_secs ({}) must exceed network.timeout_secs ({})",
        self.sync.claim_lease_secs,
        self.network.timeout_secs
      ));
    }
    for rule in &self.routes.rules {
      if !rule.prefix.starts_with('/') {
        return Err(eyre!("Route prefix '{}' must start with '/'", rule.prefix));
      }
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, path_or_url: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path_or_url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path_or_url, e))
  }

  /// Get the data directory.
  ///
  /// Checks MEDSYNC_DATA_DIR first, then the config file, then the platform
  /// data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("MEDSYNC_DATA_DIR") {
      return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("medsync"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("origin: https://app.test").unwrap();
    assert_eq!(config.cache_version, "medsync-v1");
    assert_eq!(config.sync.tag, "sync-appointments");
    assert_eq!(config.notifications.tag, "check-appointments");
    assert_eq!(config.routes.default, Strategy::NetworkFirst);
    assert_eq!(config.routes.rules.len(), 3);
    assert!(config.routes.bypass.contains(&"/sw.js".to_string()));
  }

  #[test]
  fn test_full_config() {
    let config = Config::from_yaml(
      r#"
origin: https://dashboard.clinic.test
cache_version: dash-2026-10-15
skip_waiting: true
precache: ["/", "/index.html", "/static/app.js"]
routes:
  default: bypass
  rules:
    - { prefix: "/api/reports/", strategy: cache-first }
    - { prefix: "/api/", strategy: network-first }
sync:
  max_attempts: 3
notifications:
  horizon_minutes: 60
"#,
    )
    .unwrap();

    assert!(config.skip_waiting);
    assert_eq!(config.precache.len(), 3);
    assert_eq!(config.routes.default, Strategy::Bypass);
    assert_eq!(config.routes.rules[0].strategy, Strategy::CacheFirst);
    assert_eq!(config.sync.max_attempts, 3);
    assert_eq!(config.sync.backoff_base_secs, 30);
    assert_eq!(config.sync.claim_lease(), chrono::Duration::minutes(5));
    assert_eq!(config.notifications.horizon_minutes, 60);
  }

  #[test]
  fn test_invalid_configs_are_rejected() {
    assert!(Config::from_yaml("origin: not a url").is_err());
    assert!(Config::from_yaml("origin: https://app.test\nsync:\n  max_attempts: 0").is_err());
    assert!(Config::from_yaml(
      "origin: https://app.test\nnetwork:\n  timeout_secs: 60\nsync:\n  claim_lease_secs: 30"
    )
    .is_err());
    assert!(Config::from_yaml(
      "origin: https://app.test\nroutes:\n  rules:\n    - { prefix: api, strategy: bypass }"
    )
    .is_err());
  }

  #[test]
  fn test_resolve_against_origin() {
    let config = Config::from_yaml("origin: https://app.test").unwrap();
    assert_eq!(
      config.resolve("/static/app.js").unwrap().as_str(),
      "https://app.test/static/app.js"
    );
    assert_eq!(
      config.resolve("https://cdn.test/x.js").unwrap().host_str(),
      Some("cdn.test")
    );
  }
}
