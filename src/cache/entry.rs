//! Cache entry types

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// A cached value and the instant it stops being visible.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub value: CacheValue,
  pub expires_at: Option<Instant>,
}

impl CacheEntry {
  pub fn new(value: CacheValue, ttl: Option<Duration>) -> Self {
    Self {
      value,
      expires_at: ttl.map(|d| Instant::now() + d),
    }
  }

  pub fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() > exp)
      .unwrap_or(false)
  }

  pub fn expire_in(&mut self, ttl: Duration) {
    self.expires_at = Some(Instant::now() + ttl);
  }
}

/// Cache value types, one per Redis data structure the model layer uses.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
  String(String),
  Hash(HashMap<String, String>),
  Set(HashSet<String>),
  List(Vec<String>),
}

impl CacheValue {
  /// Empty aggregates do not exist as keys.
  pub fn is_empty(&self) -> bool {
    match self {
      CacheValue::String(_) => false,
      CacheValue::Hash(h) => h.is_empty(),
      CacheValue::Set(s) => s.is_empty(),
      CacheValue::List(l) => l.is_empty(),
    }
  }
}

impl From<String> for CacheValue {
  fn from(s: String) -> Self {
    CacheValue::String(s)
  }
}

impl From<&str> for CacheValue {
  fn from(s: &str) -> Self {
    CacheValue::String(s.to_string())
  }
}
