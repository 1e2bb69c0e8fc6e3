use serde::{Deserialize, Serialize};
use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::CacheConfig;

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax.
fn expand_env_vars(input: &str) -> String {
  let mut result = input.to_string();

  while let Some(start) = result.find("${") {
    let Some(end) = result[start..].find('}') else {
      break;
    };
    let var_name = &result[start + 2..start + end];
    let value = std::env::var(var_name).unwrap_or_default();
    result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
  }

  let mut i = 0;
  while i < result.len() {
    if result[i..].starts_with('$') {
      let rest = &result[i + 1..];
      let var_len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count();
      if var_len > 0 {
        let value = std::env::var(&rest[..var_len]).unwrap_or_default();
        result = format!("{}{}{}", &result[..i], value, &rest[var_len..]);
        i += value.len();
        continue;
      }
    }
    i += 1;
  }

  result
}

/// Top-level configuration file (`cachedmodel.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheModelConfig {
  #[serde(default)]
  pub database: DatabaseSection,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
  #[serde(default)]
  pub sqlite: SqliteSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSection {
  #[serde(default = "default_sqlite_path")]
  pub path: String,
}

fn default_sqlite_path() -> String {
  ":memory:".into()
}

impl Default for SqliteSection {
  fn default() -> Self {
    Self {
      path: default_sqlite_path(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}

fn default_level() -> String {
  "info".into()
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl CacheModelConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["cachedmodel.yaml", "cachedmodel.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
/// A second call leaves the first subscriber in place.
pub fn init_logging(logging: &LoggingSection) {
  let _ = tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .try_init();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheMode;
  use std::io::Write;

  #[test]
  fn test_defaults() {
    let config = CacheModelConfig::default();
    assert_eq!(config.database.sqlite.path, ":memory:");
    assert_eq!(config.cache.mode, CacheMode::Builtin);
    assert_eq!(config.cache.key_prefix, "models");
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_expand_env_vars() {
    std::env::set_var("CACHEDMODEL_TEST_HOST", "cache.internal");
    assert_eq!(
      expand_env_vars("host: ${CACHEDMODEL_TEST_HOST}"),
      "host: cache.internal"
    );
    assert_eq!(
      expand_env_vars("host: $CACHEDMODEL_TEST_HOST:6379"),
      "host: cache.internal:6379"
    );
    assert_eq!(expand_env_vars("cost: $"), "cost: $");
  }

  #[test]
  fn test_from_file() {
    std::env::set_var("CACHEDMODEL_TEST_REDIS_PORT", "6380");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "database:\n  sqlite:\n    path: /tmp/app.db\ncache:\n  mode: redis\n  default_ttl: 60\n  redis:\n    port: ${{CACHEDMODEL_TEST_REDIS_PORT}}\nlogging:\n  level: debug"
    )
    .unwrap();

    let config = CacheModelConfig::from_file(file.path()).unwrap();
    assert_eq!(config.database.sqlite.path, "/tmp/app.db");
    assert_eq!(config.cache.mode, CacheMode::Redis);
    assert_eq!(config.cache.default_ttl, 60);
    assert_eq!(config.cache.redis.port, 6380);
    assert_eq!(config.cache.key_prefix, "models");
    assert_eq!(config.logging.level, "debug");
  }

  #[test]
  fn test_init_logging_twice() {
    let logging = LoggingSection::default();
    init_logging(&logging);
    init_logging(&logging);
  }
}
