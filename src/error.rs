//! Error types for cached model access.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::cache::CacheStoreError;

/// Result type alias for cached model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a request can terminate with.
#[derive(Error, Debug, Clone)]
pub enum Error {
  /// Bad entity definition, unknown sort preset, unknown association field.
  /// Never retried.
  #[error("configuration error: {0}")]
  Configuration(String),

  /// Field-level validation failures from a save.
  #[error("validation failed: {0}")]
  Validation(ValidationErrors),

  /// The relational store rejected or failed a query.
  #[error("backing store error: {0}")]
  BackingStore(String),

  /// The key-value cache failed a read or a key-building lookup.
  #[error("cache store error: {0}")]
  CacheStore(#[from] CacheStoreError),

  /// A request was used against its protocol (resolved twice, dropped unresolved).
  #[error("request error: {0}")]
  Request(String),
}

impl Error {
  pub fn configuration(msg: impl Into<String>) -> Self {
    Error::Configuration(msg.into())
  }

  pub fn is_configuration(&self) -> bool {
    matches!(self, Error::Configuration(_))
  }

  pub fn is_validation(&self) -> bool {
    matches!(self, Error::Validation(_))
  }
}

impl From<anyhow::Error> for Error {
  fn from(err: anyhow::Error) -> Self {
    Error::BackingStore(format!("{:#}", err))
  }
}

/// Per-field validation messages, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
  fields: BTreeMap<String, String>,
}

impl ValidationErrors {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
    self.fields.insert(field.into(), message.into());
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  pub fn get(&self, field: &str) -> Option<&str> {
    self.fields.get(field).map(String::as_str)
  }

  pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
    self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.fields.len()
  }
}

impl fmt::Display for ValidationErrors {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self
      .fields
      .iter()
      .map(|(field, msg)| format!("{}: {}", field, msg))
      .collect();
    write!(f, "{}", parts.join(", "))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_validation_errors_display() {
    let mut errors = ValidationErrors::new();
    errors.add("name", "invalid length");
    errors.add("email", "can not be null");
    assert_eq!(errors.len(), 2);
    assert_eq!(
      errors.to_string(),
      "email: can not be null, name: invalid length"
    );
    assert_eq!(errors.get("name"), Some("invalid length"));
  }

  #[test]
  fn test_anyhow_maps_to_backing_store() {
    let err: Error = anyhow::anyhow!("no such table: user").into();
    assert!(matches!(err, Error::BackingStore(ref m) if m.contains("no such table")));
  }
}
