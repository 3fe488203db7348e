use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::credentials::DisplayMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the application is served from. Same-origin checks and the
  /// token key salt both use it.
  pub origin: String,
  /// Base URL mutations are sent (and replayed) to
  pub api_base_url: String,
  /// Ambient user agent string, seed of the token key
  pub user_agent: String,
  /// Display mode the shell reports (browser or standalone)
  pub display_mode: DisplayMode,
  /// Whether the application runs inside a native shell
  pub native_bridge: bool,
  pub cache: CacheConfig,
  pub monitor: MonitorConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      api_base_url: "http://localhost:8000".to_string(),
      user_agent: concat!("offgrid/", env!("CARGO_PKG_VERSION")).to_string(),
      display_mode: DisplayMode::Browser,
      native_bridge: false,
      cache: CacheConfig::default(),
      monitor: MonitorConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version tag baked into every bucket name
  pub version: String,
  /// Bucket name prefix (e.g. "traveltailor" -> "traveltailor-static-v1")
  pub prefix: String,
  /// Same-origin paths pre-cached at install and served cache-first
  pub static_assets: Vec<String>,
  /// Path prefix of the built static bundle
  pub static_prefix: String,
  /// Store cache-first misses in the static bucket instead of only at install
  pub static_populate_on_miss: bool,
  /// Path prefix of API traffic (network-first)
  pub api_prefix: String,
  /// Host substrings identifying the map tile provider
  pub tile_hosts: Vec<String>,
  /// Path substring identifying proxied tile requests
  pub tile_path_marker: String,
  /// Upper bound on entries in the tile bucket
  pub tile_max_entries: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      prefix: "traveltailor".to_string(),
      static_assets: vec![
        "/".to_string(),
        "/favicon.ico".to_string(),
        "/manifest.json".to_string(),
        "/fonts/pretendard.css".to_string(),
      ],
      static_prefix: "/_next/static/".to_string(),
      static_populate_on_miss: false,
      api_prefix: "/api/".to_string(),
      tile_hosts: vec!["tiles.mapbox.com".to_string()],
      tile_path_marker: "/mapbox/tile".to_string(),
      tile_max_entries: 700,
    }
  }
}

impl CacheConfig {
  pub fn static_bucket(&self) -> String {
    format!("{}-static-{}", self.prefix, self.version)
  }

  pub fn api_bucket(&self) -> String {
    format!("{}-api-{}", self.prefix, self.version)
  }

  pub fn tile_bucket(&self) -> String {
    format!("{}-map-{}", self.prefix, self.version)
  }

  /// Prefix shared by tile buckets of every version.
  pub fn tile_bucket_prefix(&self) -> String {
    format!("{}-map-", self.prefix)
  }

  /// The three bucket names valid for the current version.
  pub fn current_buckets(&self) -> [String; 3] {
    [self.static_bucket(), self.api_bucket(), self.tile_bucket()]
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
  /// URL polled to detect connectivity (defaults to api_base_url)
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 15,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  ///
  /// Falls back to defaults when no file exists and no path was given.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    Url::parse(&self.api_base_url)
      .map_err(|e| eyre!("Invalid api_base_url '{}': {}", self.api_base_url, e))?;
    if self.cache.tile_max_entries == 0 {
      return Err(eyre!("cache.tile_max_entries must be at least 1"));
    }
    if self.monitor.probe_interval_secs == 0 {
      return Err(eyre!("monitor.probe_interval_secs must be at least 1"));
    }
    Ok(())
  }

  /// Display mode, honoring `OFFGRID_DISPLAY_MODE` at call time.
  pub fn current_display_mode(&self) -> DisplayMode {
    std::env::var("OFFGRID_DISPLAY_MODE")
      .ok()
      .and_then(|v| v.parse().ok())
      .unwrap_or(self.display_mode)
  }

  pub fn probe_url(&self) -> &str {
    self
      .monitor
      .probe_url
      .as_deref()
      .unwrap_or(&self.api_base_url)
  }

  /// Get a bearer token from the environment.
  ///
  /// Checks OFFGRID_TOKEN.
  pub fn get_token() -> Result<String> {
    std::env::var("OFFGRID_TOKEN")
      .map_err(|_| eyre!("No token given. Pass one or set the OFFGRID_TOKEN environment variable."))
  }

  /// Directory holding the databases, credential file and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid"))
  }
}
