use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::RoutePolicy;
use crate::db::Database;
use crate::sync::{RetryPolicy, SyncSettings};

/// Environment variable holding the endpoint bearer token
pub const TOKEN_ENV: &str = "FIELDSYNC_ENDPOINT_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub endpoint: EndpointConfig,
  pub store: StoreConfig,
  pub sync: SyncConfig,
  pub connectivity: ConnectivityConfig,
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
  /// Remote mutation endpoint; may also come from `--endpoint`
  pub url: Option<String>,
  pub timeout_secs: u64,
}

impl Default for EndpointConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Queue database (default: $XDG_DATA_HOME/fieldsync/queue.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_batch_size: usize,
  pub max_claim: usize,
  /// Offline→online must hold this long before a pass is requested
  pub debounce_ms: u64,
  pub purge_delay_ms: u64,
  pub claim_timeout_secs: u64,
  pub backoff_base_ms: u64,
  pub backoff_max_secs: u64,
  pub max_attempts: u32,
  /// Periodic wake in `run`; 0 disables it
  pub periodic_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let settings = SyncSettings::default();
    Self {
      max_batch_size: settings.max_batch_size,
      max_claim: settings.max_claim,
      debounce_ms: 1500,
      purge_delay_ms: settings.purge_delay.as_millis() as u64,
      claim_timeout_secs: settings.claim_timeout.as_secs(),
      backoff_base_ms: settings.retry.base.as_millis() as u64,
      backoff_max_secs: settings.retry.max_delay.as_secs(),
      max_attempts: settings.retry.max_attempts,
      periodic_interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Polled with HEAD in `run`; without it the process assumes online
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
  pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 15,
      probe_timeout_ms: 3000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Cache database (default: $XDG_DATA_HOME/fieldsync/cache.db)
  pub path: Option<PathBuf>,
  /// Generation suffix; bumping it purges the previous caches
  pub version: String,
  /// Base for relative URLs given to `fetch`
  pub origin: Option<String>,
  #[serde(flatten)]
  pub routes: RoutePolicy,
  pub placeholder_body: String,
  /// Fetched into the static generation on `cache-activate`
  pub precache: Vec<String>,
  pub timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      version: "v1".to_string(),
      origin: None,
      routes: RoutePolicy::default(),
      placeholder_body: "You are offline. Changes you make are saved and will sync when you reconnect."
        .to_string(),
      precache: Vec::new(),
      timeout_secs: 15,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  ///
  /// Without any file the defaults apply.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn endpoint_url(&self) -> Result<Url> {
    let raw = self.endpoint.url.as_deref().ok_or_else(|| {
      eyre!("No mutation endpoint configured. Set endpoint.url in the config file or pass --endpoint.")
    })?;
    Url::parse(raw).map_err(|e| eyre!("Invalid endpoint URL '{}': {}", raw, e))
  }

  pub fn endpoint_timeout(&self) -> Duration {
    Duration::from_secs(self.endpoint.timeout_secs)
  }

  /// Get the endpoint bearer token from the environment, if set.
  pub fn endpoint_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty())
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.store.path {
      Some(p) => Ok(p.clone()),
      None => Database::default_path("queue.db")
        .ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }

  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(p) => Ok(p.clone()),
      None => Database::default_path("cache.db")
        .ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }

  /// Resolve a `fetch` argument against the configured origin.
  pub fn resolve_url(&self, raw: &str) -> Result<Url> {
    match Url::parse(raw) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => {
        let origin = self.cache.origin.as_deref().ok_or_else(|| {
          eyre!("'{}' is relative and cache.origin is not set", raw)
        })?;
        Url::parse(origin)
          .and_then(|base| base.join(raw))
          .map_err(|e| eyre!("Invalid URL '{}' against origin '{}': {}", raw, origin, e))
      }
      Err(e) => Err(eyre!("Invalid URL '{}': {}", raw, e)),
    }
  }

  pub fn probe_url(&self) -> Result<Option<Url>> {
    self
      .connectivity
      .probe_url
      .as_deref()
      .map(|raw| Url::parse(raw).map_err(|e| eyre!("Invalid probe URL '{}': {}", raw, e)))
      .transpose()
  }

  pub fn sync_settings(&self) -> SyncSettings {
    let s = &self.sync;
    SyncSettings {
      max_batch_size: s.max_batch_size.max(1),
      max_claim: s.max_claim.max(1),
      purge_delay: Duration::from_millis(s.purge_delay_ms),
      claim_timeout: Duration::from_secs(s.claim_timeout_secs),
      retry: RetryPolicy {
        base: Duration::from_millis(s.backoff_base_ms),
        max_delay: Duration::from_secs(s.backoff_max_secs),
        max_attempts: s.max_attempts.max(1),
      },
    }
  }

  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.sync.debounce_ms)
  }

  pub fn periodic_interval(&self) -> Option<Duration> {
    match self.sync.periodic_interval_secs {
      0 => None,
      secs => Some(Duration::from_secs(secs)),
    }
  }
}
