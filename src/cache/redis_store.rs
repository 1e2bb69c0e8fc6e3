//! Redis-backed cache store for connecting to external Redis servers

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::config::RedisConfig;
use crate::cache::store::{CacheStats, CacheStore, CacheStoreError, SortByPattern};

impl From<RedisError> for CacheStoreError {
  fn from(err: RedisError) -> Self {
    if err.code() == Some("WRONGTYPE") {
      CacheStoreError::WrongType(err.to_string())
    } else {
      CacheStoreError::Connection(err.to_string())
    }
  }
}

/// Millisecond expiry for `PEXPIRE`/`PSETEX`. Never zero: a zero expiry
/// deletes the key outright.
fn ttl_millis(ttl: Duration) -> u64 {
  u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Cache store that talks to an external Redis server
pub struct RedisCacheStore {
  connection: ConnectionManager,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl RedisCacheStore {
  /// Create a new Redis client from configuration
  pub async fn new(config: &RedisConfig) -> Result<Self, RedisError> {
    let client = Client::open(config.connection_url())?;
    let connection = ConnectionManager::new(client).await?;

    Ok(Self {
      connection,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    })
  }

  fn record(&self, hit: bool) {
    if hit {
      self.hits.fetch_add(1, Ordering::Relaxed);
    } else {
      self.misses.fetch_add(1, Ordering::Relaxed);
    }
  }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
  async fn get(&self, key: &str) -> Result<Option<String>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let value: Option<String> = conn.get(key).await?;
    self.record(value.is_some());
    Ok(value)
  }

  async fn set(
    &self,
    key: &str,
    value: &str,
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    match ttl {
      Some(duration) => conn.pset_ex::<_, _, ()>(key, value, ttl_millis(duration)).await?,
      None => conn.set::<_, _, ()>(key, value).await?,
    }
    Ok(())
  }

  async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    Ok(conn.set_nx(key, value).await?)
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    let removed: i64 = conn.del(key).await?;
    Ok(removed > 0)
  }

  async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    Ok(conn.exists(key).await?)
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    Ok(conn.pexpire(key, ttl_millis(ttl) as i64).await?)
  }

  async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let hash: HashMap<String, String> = conn.hgetall(key).await?;
    self.record(!hash.is_empty());
    // HGETALL answers an empty map for a missing key
    Ok(if hash.is_empty() { None } else { Some(hash) })
  }

  async fn hreplace(&self, key: &str, fields: &[(String, String)]) -> Result<(), CacheStoreError> {
    self
      .hreplace_many(&[(key.to_string(), fields.to_vec())])
      .await
  }

  async fn hgetall_many(
    &self,
    keys: &[String],
  ) -> Result<Vec<Option<HashMap<String, String>>>, CacheStoreError> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }

    let mut conn = self.connection.clone();
    let mut pipe = redis::pipe();
    pipe.atomic();
    for key in keys {
      pipe.hgetall(key);
    }
    let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

    Ok(
      hashes
        .into_iter()
        .map(|hash| {
          self.record(!hash.is_empty());
          if hash.is_empty() {
            None
          } else {
            Some(hash)
          }
        })
        .collect(),
    )
  }

  async fn hreplace_many(
    &self,
    entries: &[(String, Vec<(String, String)>)],
  ) -> Result<(), CacheStoreError> {
    if entries.is_empty() {
      return Ok(());
    }

    let mut conn = self.connection.clone();
    let mut pipe = redis::pipe();
    pipe.atomic();
    for (key, fields) in entries {
      pipe.del(key).ignore();
      if !fields.is_empty() {
        pipe.hset_multiple(key, fields).ignore();
      }
    }
    pipe.query_async::<()>(&mut conn).await?;
    Ok(())
  }

  async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, CacheStoreError> {
    if members.is_empty() {
      return Ok(0);
    }
    let mut conn = self.connection.clone();
    Ok(conn.sadd(key, members).await?)
  }

  async fn srem(&self, key: &str, members: &[String]) -> Result<usize, CacheStoreError> {
    if members.is_empty() {
      return Ok(0);
    }
    let mut conn = self.connection.clone();
    Ok(conn.srem(key, members).await?)
  }

  async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let members: Vec<String> = conn.smembers(key).await?;
    self.record(!members.is_empty());
    Ok(members)
  }

  async fn lrange(&self, key: &str) -> Result<Vec<String>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let items: Vec<String> = conn.lrange(key, 0, -1).await?;
    self.record(!items.is_empty());
    Ok(items)
  }

  async fn replace_list(
    &self,
    key: &str,
    items: &[String],
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    let mut pipe = redis::pipe();
    pipe.atomic();
    pipe.del(key).ignore();
    if !items.is_empty() {
      pipe.rpush(key, items).ignore();
      if let Some(ttl) = ttl {
        pipe.pexpire(key, ttl_millis(ttl) as i64).ignore();
      }
    }
    pipe.query_async::<()>(&mut conn).await?;
    Ok(())
  }

  async fn sort_store(&self, request: &SortByPattern) -> Result<usize, CacheStoreError> {
    let mut conn = self.connection.clone();
    let mut cmd = redis::cmd("SORT");
    cmd.arg(&request.source).arg("BY").arg(&request.by);
    if request.alpha {
      cmd.arg("ALPHA");
    }
    cmd
      .arg(if request.descending { "DESC" } else { "ASC" })
      .arg("STORE")
      .arg(&request.destination);
    Ok(cmd.query_async::<usize>(&mut conn).await?)
  }

  async fn flush(&self) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
    Ok(())
  }

  async fn info(&self) -> CacheStats {
    let mut conn = self.connection.clone();
    let dbsize: Result<usize, _> = redis::cmd("DBSIZE").query_async(&mut conn).await;

    CacheStats {
      keys: dbsize.unwrap_or(0),
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      expired: 0, // Not tracked locally for an external server
    }
  }
}
