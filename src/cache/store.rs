//! Cache store implementation

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::entry::{CacheEntry, CacheValue};

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
  pub keys: usize,
  pub hits: u64,
  pub misses: u64,
  pub expired: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

/// A `SORT source BY pattern [ALPHA] ASC|DESC STORE destination` request.
///
/// `by` is either a plain key pattern (`weights:*`) or a hash field pattern
/// (`models:user:*->name`); the first `*` is replaced by each member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortByPattern {
  pub source: String,
  pub by: String,
  pub alpha: bool,
  pub descending: bool,
  pub destination: String,
}

/// Cache store trait
///
/// The primitives the coherence layer depends on: scalar strings, per-key
/// field maps, unordered sets, ordered lists, an atomic multi-get, and an
/// atomic sort-by-pattern that stores its result.
#[async_trait]
pub trait CacheStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<String>, CacheStoreError>;
  async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<(), CacheStoreError>;
  /// Write `value` only when `key` does not exist. Returns whether it was written.
  async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, CacheStoreError>;
  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError>;
  async fn exists(&self, key: &str) -> Result<bool, CacheStoreError>;
  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheStoreError>;

  /// Whole hash, or `None` when the key does not exist.
  async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>, CacheStoreError>;
  /// Replace the hash stored at `key` with exactly `fields`.
  async fn hreplace(&self, key: &str, fields: &[(String, String)]) -> Result<(), CacheStoreError>;
  /// Atomic multi-get of hashes; one slot per key, in key order.
  async fn hgetall_many(
    &self,
    keys: &[String],
  ) -> Result<Vec<Option<HashMap<String, String>>>, CacheStoreError>;
  /// Atomic batch of `hreplace` calls.
  async fn hreplace_many(
    &self,
    entries: &[(String, Vec<(String, String)>)],
  ) -> Result<(), CacheStoreError>;

  async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, CacheStoreError>;
  async fn srem(&self, key: &str, members: &[String]) -> Result<usize, CacheStoreError>;
  async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheStoreError>;

  /// Full contents of a list, empty when the key does not exist.
  async fn lrange(&self, key: &str) -> Result<Vec<String>, CacheStoreError>;
  /// Replace a list; an empty `items` deletes the key.
  async fn replace_list(
    &self,
    key: &str,
    items: &[String],
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError>;

  /// Run the sort and store the ordered members, returning how many were stored.
  async fn sort_store(&self, request: &SortByPattern) -> Result<usize, CacheStoreError>;

  async fn flush(&self) -> Result<(), CacheStoreError>;
  async fn info(&self) -> CacheStats;
}

/// Store operation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStoreError {
  /// Operation against a key holding the wrong kind of value
  WrongType(String),
  InvalidValue(String),
  Connection(String),
}

impl std::fmt::Display for CacheStoreError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheStoreError::WrongType(key) => write!(
        f,
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
      ),
      CacheStoreError::InvalidValue(msg) => write!(f, "Invalid value: {}", msg),
      CacheStoreError::Connection(msg) => write!(f, "Connection error: {}", msg),
    }
  }
}

impl std::error::Error for CacheStoreError {}

/// In-memory cache store implementation
pub struct InMemoryCacheStore {
  data: RwLock<HashMap<String, CacheEntry>>,
  hits: AtomicU64,
  misses: AtomicU64,
  expired: AtomicU64,
}

impl Default for InMemoryCacheStore {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryCacheStore {
  /// An empty store. Keys only expire when a TTL is given for them.
  pub fn new() -> Self {
    Self {
      data: RwLock::new(HashMap::new()),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      expired: AtomicU64::new(0),
    }
  }

  /// Check and evict expired entries
  pub fn evict_expired(&self) -> usize {
    let mut data = self.data.write();
    let before = data.len();
    data.retain(|_, entry| !entry.is_expired());
    let count = before - data.len();
    self.expired.fetch_add(count as u64, Ordering::Relaxed);
    count
  }

  /// Read a live entry, dropping it first if it has expired.
  fn read_value<R>(
    &self,
    key: &str,
    f: impl FnOnce(&CacheValue) -> Result<R, CacheStoreError>,
  ) -> Result<Option<R>, CacheStoreError> {
    let mut data = self.data.write();
    let expired = match data.get(key) {
      Some(entry) => entry.is_expired(),
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        return Ok(None);
      }
    };

    if expired {
      data.remove(key);
      self.expired.fetch_add(1, Ordering::Relaxed);
      self.misses.fetch_add(1, Ordering::Relaxed);
      return Ok(None);
    }

    let entry = data.get(key).ok_or_else(|| CacheStoreError::InvalidValue(key.into()))?;
    self.hits.fetch_add(1, Ordering::Relaxed);
    f(&entry.value).map(Some)
  }

  /// Mutate (or create) an aggregate entry, removing it when it ends up empty.
  fn write_value<R>(
    data: &mut HashMap<String, CacheEntry>,
    key: &str,
    create: impl FnOnce() -> CacheValue,
    f: impl FnOnce(&mut CacheValue) -> Result<R, CacheStoreError>,
  ) -> Result<R, CacheStoreError> {
    if data.get(key).map(|e| e.is_expired()).unwrap_or(false) {
      data.remove(key);
    }

    let entry = data
      .entry(key.to_string())
      .or_insert_with(|| CacheEntry::new(create(), None));
    let result = f(&mut entry.value);
    if entry.value.is_empty() {
      data.remove(key);
    }
    result
  }

  fn live_value(data: &HashMap<String, CacheEntry>, key: &str) -> Option<CacheValue> {
    data
      .get(key)
      .filter(|e| !e.is_expired())
      .map(|e| e.value.clone())
  }

  /// Resolve a SORT weight for one member.
  fn sort_weight(data: &HashMap<String, CacheEntry>, by: &str, member: &str) -> Option<String> {
    let (key_pattern, field) = match by.split_once("->") {
      Some((k, f)) => (k, Some(f)),
      None => (by, None),
    };
    let key = key_pattern.replacen('*', member, 1);

    match (Self::live_value(data, &key)?, field) {
      (CacheValue::Hash(hash), Some(field)) => hash.get(field).cloned(),
      (CacheValue::String(s), None) => Some(s),
      _ => None,
    }
  }
}

fn compare_members(a: &str, b: &str) -> CmpOrdering {
  match (a.parse::<f64>(), b.parse::<f64>()) {
    (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
    _ => a.cmp(b),
  }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
  async fn get(&self, key: &str) -> Result<Option<String>, CacheStoreError> {
    self.read_value(key, |value| match value {
      CacheValue::String(s) => Ok(s.clone()),
      _ => Err(CacheStoreError::WrongType(key.to_string())),
    })
  }

  async fn set(
    &self,
    key: &str,
    value: &str,
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError> {
    let mut data = self.data.write();
    data.insert(key.to_string(), CacheEntry::new(CacheValue::from(value), ttl));
    Ok(())
  }

  async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    if data.get(key).map(|e| !e.is_expired()).unwrap_or(false) {
      return Ok(false);
    }
    data.insert(key.to_string(), CacheEntry::new(CacheValue::from(value), None));
    Ok(true)
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    Ok(data.remove(key).map(|e| !e.is_expired()).unwrap_or(false))
  }

  async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
    let data = self.data.read();
    Ok(data.get(key).map(|e| !e.is_expired()).unwrap_or(false))
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    if let Some(entry) = data.get_mut(key) {
      if entry.is_expired() {
        return Ok(false);
      }
      entry.expire_in(ttl);
      Ok(true)
    } else {
      Ok(false)
    }
  }

  async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>, CacheStoreError> {
    self.read_value(key, |value| match value {
      CacheValue::Hash(h) => Ok(h.clone()),
      _ => Err(CacheStoreError::WrongType(key.to_string())),
    })
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
    // One lock for the whole batch keeps the multi-get atomic
    let data = self.data.read();
    let mut results = Vec::with_capacity(keys.len());
    for key in keys {
      match Self::live_value(&data, key) {
        Some(CacheValue::Hash(h)) => {
          self.hits.fetch_add(1, Ordering::Relaxed);
          results.push(Some(h));
        }
        Some(_) => return Err(CacheStoreError::WrongType(key.clone())),
        None => {
          self.misses.fetch_add(1, Ordering::Relaxed);
          results.push(None);
        }
      }
    }
    Ok(results)
  }

  async fn hreplace_many(
    &self,
    entries: &[(String, Vec<(String, String)>)],
  ) -> Result<(), CacheStoreError> {
    let mut data = self.data.write();
    for (key, fields) in entries {
      if fields.is_empty() {
        data.remove(key);
        continue;
      }
      let hash: HashMap<String, String> = fields.iter().cloned().collect();
      data.insert(
        key.clone(),
        CacheEntry::new(CacheValue::Hash(hash), None),
      );
    }
    Ok(())
  }

  async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, CacheStoreError> {
    let mut data = self.data.write();
    Self::write_value(
      &mut data,
      key,
      || CacheValue::Set(HashSet::new()),
      |value| match value {
        CacheValue::Set(set) => Ok(members.iter().filter(|m| set.insert((*m).clone())).count()),
        _ => Err(CacheStoreError::WrongType(key.to_string())),
      },
    )
  }

  async fn srem(&self, key: &str, members: &[String]) -> Result<usize, CacheStoreError> {
    let mut data = self.data.write();
    if !data.contains_key(key) {
      return Ok(0);
    }
    Self::write_value(
      &mut data,
      key,
      || CacheValue::Set(HashSet::new()),
      |value| match value {
        CacheValue::Set(set) => Ok(members.iter().filter(|m| set.remove(*m)).count()),
        _ => Err(CacheStoreError::WrongType(key.to_string())),
      },
    )
  }

  async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheStoreError> {
    let members = self.read_value(key, |value| match value {
      CacheValue::Set(set) => Ok(set.iter().cloned().collect::<Vec<_>>()),
      _ => Err(CacheStoreError::WrongType(key.to_string())),
    })?;
    Ok(members.unwrap_or_default())
  }

  async fn lrange(&self, key: &str) -> Result<Vec<String>, CacheStoreError> {
    let items = self.read_value(key, |value| match value {
      CacheValue::List(list) => Ok(list.clone()),
      _ => Err(CacheStoreError::WrongType(key.to_string())),
    })?;
    Ok(items.unwrap_or_default())
  }

  async fn replace_list(
    &self,
    key: &str,
    items: &[String],
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError> {
    let mut data = self.data.write();
    if items.is_empty() {
      data.remove(key);
    } else {
      data.insert(
        key.to_string(),
        CacheEntry::new(CacheValue::List(items.to_vec()), ttl),
      );
    }
    Ok(())
  }

  async fn sort_store(&self, request: &SortByPattern) -> Result<usize, CacheStoreError> {
    let mut data = self.data.write();

    let members: Vec<String> = match Self::live_value(&data, &request.source) {
      Some(CacheValue::Set(set)) => set.into_iter().collect(),
      Some(CacheValue::List(list)) => list,
      Some(_) => return Err(CacheStoreError::WrongType(request.source.clone())),
      None => Vec::new(),
    };

    let mut weighted: Vec<(String, Option<String>)> = members
      .into_iter()
      .map(|m| {
        let weight = Self::sort_weight(&data, &request.by, &m);
        (m, weight)
      })
      .collect();

    if request.alpha {
      weighted.sort_by(|(ma, wa), (mb, wb)| {
        let wa = wa.as_deref().unwrap_or("");
        let wb = wb.as_deref().unwrap_or("");
        wa.cmp(wb).then_with(|| compare_members(ma, mb))
      });
    } else {
      let mut scored = Vec::with_capacity(weighted.len());
      for (member, weight) in weighted {
        let score = match weight.as_deref() {
          None | Some("") => 0.0,
          Some(w) => w.parse::<f64>().map_err(|_| {
            CacheStoreError::InvalidValue(
              "One or more scores can't be converted into double".to_string(),
            )
          })?,
        };
        scored.push((member, score));
      }
      scored.sort_by(|(ma, a), (mb, b)| {
        a.partial_cmp(b)
          .unwrap_or(CmpOrdering::Equal)
          .then_with(|| compare_members(ma, mb))
      });
      weighted = scored.into_iter().map(|(m, _)| (m, None)).collect();
    }

    let mut sorted: Vec<String> = weighted.into_iter().map(|(m, _)| m).collect();
    if request.descending {
      sorted.reverse();
    }

    let count = sorted.len();
    if sorted.is_empty() {
      data.remove(&request.destination);
    } else {
      data.insert(
        request.destination.clone(),
        CacheEntry::new(CacheValue::List(sorted), None),
      );
    }
    Ok(count)
  }

  async fn flush(&self) -> Result<(), CacheStoreError> {
    self.data.write().clear();
    Ok(())
  }

  async fn info(&self) -> CacheStats {
    let data = self.data.read();
    CacheStats {
      keys: data.values().filter(|e| !e.is_expired()).count(),
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      expired: self.expired.load(Ordering::Relaxed),
    }
  }
}
