//! Named store handles passed to models at construction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{CacheConfig, CacheMode, CacheStore, InMemoryCacheStore};
use crate::cached::CachedModel;
use crate::config::CacheModelConfig;
use crate::db::DatabaseBackend;
use crate::error::{Error, Result};
use crate::model::{EntityDefinition, Model};

pub const DEFAULT_LABEL: &str = "default";

/// Relational and cache handles keyed by label, plus the cache settings
/// every cached model built from this context shares.
#[derive(Clone, Default)]
pub struct StoreContext {
  databases: HashMap<String, Arc<dyn DatabaseBackend>>,
  caches: HashMap<String, Arc<dyn CacheStore>>,
  cache_config: CacheConfig,
}

impl std::fmt::Debug for StoreContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut databases: Vec<&String> = self.databases.keys().collect();
    let mut caches: Vec<&String> = self.caches.keys().collect();
    databases.sort();
    caches.sort();
    f.debug_struct("StoreContext")
      .field("databases", &databases)
      .field("caches", &caches)
      .field("cache_config", &self.cache_config)
      .finish()
  }
}

impl StoreContext {
  pub fn new(cache_config: CacheConfig) -> Self {
    Self {
      cache_config,
      ..Default::default()
    }
  }

  /// Open the `default` handles described by `config`.
  pub async fn connect(config: &CacheModelConfig) -> Result<Self> {
    let db = open_database(config).await?;
    let cache: Arc<dyn CacheStore> = match config.cache.mode {
      CacheMode::Builtin => Arc::new(InMemoryCacheStore::new()),
      CacheMode::Redis => open_redis(&config.cache).await?,
    };
    tracing::info!(cache = %config.cache.mode, "store context connected");

    Ok(
      Self::new(config.cache.clone())
        .with_database(DEFAULT_LABEL, db)
        .with_cache(DEFAULT_LABEL, cache),
    )
  }

  pub fn with_database(mut self, label: impl Into<String>, db: Arc<dyn DatabaseBackend>) -> Self {
    self.databases.insert(label.into(), db);
    self
  }

  pub fn with_cache(mut self, label: impl Into<String>, cache: Arc<dyn CacheStore>) -> Self {
    self.caches.insert(label.into(), cache);
    self
  }

  pub fn cache_config(&self) -> &CacheConfig {
    &self.cache_config
  }

  pub fn database(&self, label: &str) -> Result<Arc<dyn DatabaseBackend>> {
    self
      .databases
      .get(label)
      .cloned()
      .ok_or_else(|| Error::configuration(format!("no database registered as {:?}", label)))
  }

  pub fn cache(&self, label: &str) -> Result<Arc<dyn CacheStore>> {
    self
      .caches
      .get(label)
      .cloned()
      .ok_or_else(|| Error::configuration(format!("no cache registered as {:?}", label)))
  }

  /// Plain model over the `default` database.
  pub fn model(&self, definition: Arc<EntityDefinition>) -> Result<Model> {
    Ok(Model::new(definition, self.database(DEFAULT_LABEL)?))
  }

  /// Cached model over the `default` database and cache.
  pub fn cached_model(&self, definition: Arc<EntityDefinition>) -> Result<CachedModel> {
    self.cached_model_on(definition, DEFAULT_LABEL, DEFAULT_LABEL)
  }

  pub fn cached_model_on(
    &self,
    definition: Arc<EntityDefinition>,
    database: &str,
    cache: &str,
  ) -> Result<CachedModel> {
    let model = Model::new(definition, self.database(database)?);
    Ok(CachedModel::new(model, self.cache(cache)?, &self.cache_config))
  }
}

#[cfg(feature = "sqlite")]
async fn open_database(config: &CacheModelConfig) -> Result<Arc<dyn DatabaseBackend>> {
  let backend = crate::db::SqliteBackend::new(&config.database.sqlite.path).await?;
  Ok(Arc::new(backend))
}

#[cfg(not(feature = "sqlite"))]
async fn open_database(_config: &CacheModelConfig) -> Result<Arc<dyn DatabaseBackend>> {
  Err(Error::configuration(
    "no relational backend compiled in; enable the `sqlite` feature",
  ))
}

#[cfg(feature = "redis")]
async fn open_redis(config: &CacheConfig) -> Result<Arc<dyn CacheStore>> {
  let store = crate::cache::RedisCacheStore::new(&config.redis)
    .await
    .map_err(crate::cache::CacheStoreError::from)?;
  Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(_config: &CacheConfig) -> Result<Arc<dyn CacheStore>> {
  Err(Error::configuration(
    "cache mode is redis but the `redis` feature is disabled",
  ))
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_connect_builtin() {
    let context = StoreContext::connect(&CacheModelConfig::default())
      .await
      .unwrap();
    assert!(context.database(DEFAULT_LABEL).is_ok());
    assert!(context.cache(DEFAULT_LABEL).is_ok());
    assert!(matches!(context.cache("sessions"), Err(e) if e.is_configuration()));
  }

  #[tokio::test]
  async fn test_collection_ttl_does_not_expire_other_keys() {
    let mut config = CacheModelConfig::default();
    config.cache.default_ttl = 1;
    let context = StoreContext::connect(&config).await.unwrap();
    let cache = context.cache(DEFAULT_LABEL).unwrap();

    cache.set("cache:times:users", "1700000000.000", None).await.unwrap();
    cache
      .hreplace("models:user:1", &[("id".into(), "1".into())])
      .await
      .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));

    assert_eq!(
      cache.get("cache:times:users").await.unwrap().as_deref(),
      Some("1700000000.000")
    );
    assert!(cache.exists("models:user:1").await.unwrap());
  }
}
