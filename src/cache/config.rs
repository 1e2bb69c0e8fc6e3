//! Cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache mode: builtin in-memory or an external Redis server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  /// In-memory cache (default)
  #[default]
  Builtin,
  /// External Redis server
  Redis,
}

impl std::fmt::Display for CacheMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheMode::Builtin => write!(f, "builtin"),
      CacheMode::Redis => write!(f, "redis"),
    }
  }
}

impl std::str::FromStr for CacheMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "builtin" | "memory" | "inmemory" => Ok(CacheMode::Builtin),
      "redis" | "external" | "proxy" => Ok(CacheMode::Redis),
      _ => Err(format!("Unknown cache mode: {}", s)),
    }
  }
}

/// Connection settings for an external Redis server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
  #[serde(default = "default_host")]
  pub host: String,

  #[serde(default = "default_redis_port")]
  pub port: u16,

  #[serde(default)]
  pub password: Option<String>,

  /// Redis database number
  #[serde(default)]
  pub database: u8,

  #[serde(default)]
  pub tls_enabled: bool,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_redis_port() -> u16 {
  6379
}

impl Default for RedisConfig {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_redis_port(),
      password: None,
      database: 0,
      tls_enabled: false,
    }
  }
}

impl RedisConfig {
  /// Generate Redis connection URL
  pub fn connection_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", pwd),
      _ => String::new(),
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }
}

/// Cache section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  #[serde(default)]
  pub mode: CacheMode,

  /// Default TTL in seconds for collection keys (0 = no expiry)
  #[serde(default)]
  pub default_ttl: u64,

  /// Namespace prepended to every model key
  #[serde(default = "default_key_prefix")]
  pub key_prefix: String,

  #[serde(default)]
  pub redis: RedisConfig,
}

fn default_key_prefix() -> String {
  "models".to_string()
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      mode: CacheMode::default(),
      default_ttl: 0,
      key_prefix: default_key_prefix(),
      redis: RedisConfig::default(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Option<Duration> {
    if self.default_ttl == 0 {
      None
    } else {
      Some(Duration::from_secs(self.default_ttl))
    }
  }
}
