use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::router::SessionTag;

const DEFAULT_ONLINE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the hosting application; requests elsewhere are not intercepted
  #[serde(deserialize_with = "parse_origin")]
  pub origin: Url,
  /// Deployed version, used to name the current cache generation
  pub cache_version: String,
  /// Paths fetched and stored at install time
  #[serde(default = "default_manifest")]
  pub precache_manifest: Vec<String>,
  #[serde(default = "default_online_timeout_ms")]
  pub online_timeout_ms: u64,
  #[serde(default = "default_health_endpoint")]
  pub health_endpoint: String,
  /// Session identifier injected into every intercepted request.
  /// MTC_SESSION takes precedence over the file value.
  #[serde(default)]
  pub session_header_value: Option<String>,
  #[serde(default = "default_session_header_name")]
  pub session_header_name: String,
  /// Referrer path segments that force network-only fetching
  #[serde(default = "default_privileged_paths")]
  pub privileged_paths: Vec<String>,
  /// Promote a newly installed version without waiting for an explicit Activate
  #[serde(default = "default_true")]
  pub auto_activate: bool,
  /// Connect timeout for outbound requests (none by default)
  #[serde(default)]
  pub connect_timeout_ms: Option<u64>,
  /// Cache database location (defaults to $XDG_DATA_HOME/mtc-proxy/cache.db)
  #[serde(default)]
  pub database_path: Option<PathBuf>,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Default filter directive, overridden by RUST_LOG
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write daily rolling log files here instead of stderr
  #[serde(default)]
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn parse_origin<'de, D>(deserializer: D) -> std::result::Result<Url, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = String::deserialize(deserializer)?;
  Url::parse(&raw)
    .map_err(|e| serde::de::Error::custom(format!("invalid origin '{}': {}", raw, e)))
}

fn default_manifest() -> Vec<String> {
  vec!["/index.html".to_string()]
}

fn default_online_timeout_ms() -> u64 {
  DEFAULT_ONLINE_TIMEOUT_MS
}

fn default_health_endpoint() -> String {
  "/api/health".to_string()
}

fn default_session_header_name() -> String {
  "session".to_string()
}

fn default_privileged_paths() -> Vec<String> {
  vec!["/administrator/".to_string(), "/editor/".to_string()]
}

fn default_true() -> bool {
  true
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mtc-proxy.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mtc-proxy/config.yaml
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
        "No configuration file found. Create one at ~/.config/mtc-proxy/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("mtc-proxy.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mtc-proxy").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config.with_env_overrides().validated()
  }

  /// Parse a YAML document without consulting the environment.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn with_env_overrides(mut self) -> Self {
    if let Ok(session) = std::env::var("MTC_SESSION") {
      self.session_header_value = Some(session);
    }
    if let Ok(version) = std::env::var("MTC_CACHE_VERSION") {
      self.cache_version = version;
    }
    self
  }

  /// Reject configurations the proxy cannot run with.
  pub fn validated(self) -> Result<Self> {
    if self.cache_version.trim().is_empty() {
      return Err(eyre!("cache_version must not be empty"));
    }
    if self.session().is_empty() {
      return Err(eyre!(
        "Session identifier not found. Set session_header_value or the MTC_SESSION environment variable."
      ));
    }
    if !self.health_endpoint.starts_with('/') {
      return Err(eyre!(
        "health_endpoint must be an origin-relative path, got '{}'",
        self.health_endpoint
      ));
    }
    Ok(self)
  }

  pub fn session(&self) -> &str {
    self.session_header_value.as_deref().unwrap_or("").trim()
  }

  pub fn session_tag(&self) -> SessionTag {
    SessionTag {
      name: self.session_header_name.clone(),
      value: self.session().to_string(),
    }
  }

  pub fn online_timeout(&self) -> Duration {
    Duration::from_millis(self.online_timeout_ms)
  }

  pub fn connect_timeout(&self) -> Option<Duration> {
    self.connect_timeout_ms.map(Duration::from_millis)
  }

  /// Resolve an origin-relative path (manifest entry, health endpoint).
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}' for origin {}: {}", path, self.origin, e))
  }

  pub fn health_url(&self) -> Result<Url> {
    self.resolve(&self.health_endpoint)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database_path {
      return Ok(path.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("mtc-proxy").join("cache.db"))
  }
}
