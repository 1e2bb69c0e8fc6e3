//! Cache key construction.
//!
//! Keys look like `models:<table>[:name][:param...][:field:direction][:time]`.
//! Everything except named time buckets is pure string assembly; a named
//! bucket is read from (or first written to) `cache:times:<name>`.

use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheStore;
use crate::db::RecordId;
use crate::error::{Error, Result};
use crate::model::EntityDefinition;
use crate::request::AsyncRequest;

const TIME_KEY_PREFIX: &str = "cache:times";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
  Asc,
  #[default]
  Desc,
}

impl fmt::Display for SortDirection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SortDirection::Asc => write!(f, "asc"),
      SortDirection::Desc => write!(f, "desc"),
    }
  }
}

impl std::str::FromStr for SortDirection {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "asc" | "ascending" => Ok(SortDirection::Asc),
      "desc" | "descending" => Ok(SortDirection::Desc),
      _ => Err(format!("Unknown sort direction: {}", s)),
    }
  }
}

/// Field and direction of a sorted collection. Defaults to `id` descending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
  pub field: String,
  pub direction: SortDirection,
}

impl Default for SortSpec {
  fn default() -> Self {
    Self::new("id", SortDirection::Desc)
  }
}

impl SortSpec {
  pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
    Self {
      field: field.into(),
      direction,
    }
  }

  /// Sort by `field`, descending unless changed.
  pub fn by(field: impl Into<String>) -> Self {
    Self::new(field, SortDirection::default())
  }

  pub fn asc(mut self) -> Self {
    self.direction = SortDirection::Asc;
    self
  }

  pub fn desc(mut self) -> Self {
    self.direction = SortDirection::Desc;
    self
  }
}

/// A sort given either by preset name or spelled out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortRequest {
  Preset(String),
  Custom(SortSpec),
}

impl From<SortSpec> for SortRequest {
  fn from(spec: SortSpec) -> Self {
    SortRequest::Custom(spec)
  }
}

impl From<&str> for SortRequest {
  fn from(name: &str) -> Self {
    SortRequest::Preset(name.to_string())
  }
}

/// Describes one family of collection keys.
///
/// A bare string converts into a spec with only `name` set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySpec {
  pub name: Option<String>,
  /// Named time bucket, resolved through the cache.
  pub timer: Option<String>,
  /// Literal time bucket value. Ignored when `timer` is set.
  pub time: Option<String>,
  pub ttl: Option<Duration>,
  pub sort: Option<SortRequest>,
}

impl From<&str> for KeySpec {
  fn from(name: &str) -> Self {
    KeySpec::named(name)
  }
}

impl From<String> for KeySpec {
  fn from(name: String) -> Self {
    KeySpec::named(name)
  }
}

impl KeySpec {
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: Some(name.into()),
      ..Default::default()
    }
  }

  pub fn with_timer(mut self, timer: impl Into<String>) -> Self {
    self.timer = Some(timer.into());
    self
  }

  pub fn with_time(mut self, time: impl Into<String>) -> Self {
    self.time = Some(time.into());
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn sorted(mut self, sort: impl Into<SortRequest>) -> Self {
    self.sort = Some(sort.into());
    self
  }

  /// The same key family with the sort removed.
  pub fn unsorted(&self) -> Self {
    Self {
      sort: None,
      ..self.clone()
    }
  }
}

/// A fully resolved key plus the expiry its spec asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltKey {
  pub key: String,
  pub ttl: Option<Duration>,
}

/// Builds the cache keys of one entity.
#[derive(Clone)]
pub struct CacheKeyBuilder {
  definition: Arc<EntityDefinition>,
  prefix: String,
  cache: Arc<dyn CacheStore>,
}

impl fmt::Debug for CacheKeyBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheKeyBuilder")
      .field("prefix", &self.prefix)
      .finish()
  }
}

impl CacheKeyBuilder {
  pub fn new(definition: Arc<EntityDefinition>, namespace: &str, cache: Arc<dyn CacheStore>) -> Self {
    let prefix = format!("{}:{}", namespace, definition.table);
    Self {
      definition,
      prefix,
      cache,
    }
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  /// Assemble a key from already-resolved parts.
  pub fn compose(
    &self,
    spec: &KeySpec,
    params: &[Value],
    sort: Option<&SortSpec>,
    time: Option<&str>,
  ) -> String {
    let mut key = self.prefix.clone();
    if let Some(name) = spec.name.as_deref().filter(|n| !n.is_empty()) {
      key.push(':');
      key.push_str(name);
    }
    for param in params {
      key.push(':');
      key.push_str(&param_segment(param));
    }
    if let Some(sort) = sort {
      let _ = write!(key, ":{}:{}", sort.field, sort.direction);
    }
    if let Some(time) = time.filter(|t| !t.is_empty()) {
      key.push(':');
      key.push_str(time);
    }
    key
  }

  /// Per-id object hash.
  pub fn object_key(&self, id: RecordId) -> String {
    format!("{}:{}", self.prefix, id)
  }

  /// `(field, value) -> id` mapping.
  pub fn field_key(&self, field: &str, value: &Value) -> String {
    self.compose(&KeySpec::named(field), std::slice::from_ref(value), None, None)
  }

  /// Set of the field mapping keys that point at one id.
  pub fn field_index_key(&self, id: RecordId) -> String {
    format!("{}:fields", self.object_key(id))
  }

  /// `BY` pattern reading `field` out of every object hash.
  pub fn sort_pattern(&self, field: &str) -> String {
    format!("{}:*->{}", self.prefix, field)
  }

  /// Turn a preset name into its sort, or check a custom sort's field.
  pub fn resolve_sort(&self, sort: &SortRequest) -> Result<SortSpec> {
    let spec = match sort {
      SortRequest::Preset(name) => self
        .definition
        .sort(name)
        .cloned()
        .ok_or_else(|| Error::configuration(format!("Invalid pre-defined sort: {}", name)))?,
      SortRequest::Custom(spec) => spec.clone(),
    };
    if self.definition.field(&spec.field).is_none() {
      return Err(Error::configuration(format!(
        "cannot sort {} by unknown field {}",
        self.definition.table, spec.field
      )));
    }
    Ok(spec)
  }

  /// Time segment for `spec`: a named bucket wins over a literal.
  pub async fn resolve_time(&self, spec: &KeySpec) -> Result<Option<String>> {
    match (&spec.timer, &spec.time) {
      (Some(timer), _) => Ok(Some(self.time_bucket(timer).await?)),
      (None, time) => Ok(time.clone()),
    }
  }

  /// Current value of a time bucket, stamping it now if it has none.
  pub async fn time_bucket(&self, name: &str) -> Result<String> {
    let key = format!("{}:{}", TIME_KEY_PREFIX, name);
    if let Some(value) = self.cache.get(&key).await? {
      return Ok(value);
    }
    let now = format_stamp(now_millis());
    if self.cache.set_if_absent(&key, &now).await? {
      tracing::debug!(bucket = name, time = %now, "initialized time bucket");
      return Ok(now);
    }
    // another caller stamped it first
    Ok(self.cache.get(&key).await?.unwrap_or(now))
  }

  /// Move a time bucket forward so every key built with it changes.
  pub async fn bump_time(&self, name: &str) -> Result<String> {
    let key = format!("{}:{}", TIME_KEY_PREFIX, name);
    let previous = self
      .cache
      .get(&key)
      .await?
      .and_then(|v| v.parse::<f64>().ok())
      .map(|secs| (secs * 1000.0).round() as u64);

    let mut millis = now_millis();
    if let Some(prev) = previous {
      millis = millis.max(prev + 1);
    }
    let stamp = format_stamp(millis);
    self.cache.set(&key, &stamp, None).await?;
    tracing::debug!(bucket = name, time = %stamp, "bumped time bucket");
    Ok(stamp)
  }

  /// Resolve the sort and time bucket of `spec` and assemble the key.
  pub async fn resolve(&self, spec: &KeySpec, params: &[Value]) -> Result<BuiltKey> {
    let sort = spec.sort.as_ref().map(|s| self.resolve_sort(s)).transpose()?;
    let time = self.resolve_time(spec).await?;
    Ok(BuiltKey {
      key: self.compose(spec, params, sort.as_ref(), time.as_deref()),
      ttl: spec.ttl,
    })
  }

  /// [`CacheKeyBuilder::resolve`], delivered through a request.
  pub fn build(&self, spec: impl Into<KeySpec>, params: Vec<Value>) -> AsyncRequest<BuiltKey> {
    let this = self.clone();
    let spec = spec.into();
    AsyncRequest::spawn(async move { this.resolve(&spec, &params).await })
  }
}

fn param_segment(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn now_millis() -> u64 {
  u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Unix seconds with millisecond precision.
fn format_stamp(millis: u64) -> String {
  format!("{}.{:03}", millis / 1000, millis % 1000)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::InMemoryCacheStore;
  use crate::model::{FieldDefinition, FieldType};
  use serde_json::json;

  fn builder() -> CacheKeyBuilder {
    let definition = EntityDefinition::builder("user")
      .field(FieldDefinition::new("id", FieldType::Id))
      .field(FieldDefinition::new("name", FieldType::String))
      .sort("alphabetical", "name", SortDirection::Asc)
      .build()
      .unwrap();
    CacheKeyBuilder::new(definition, "models", Arc::new(InMemoryCacheStore::default()))
  }

  #[test]
  fn test_compose() {
    let keys = builder();
    assert_eq!(keys.compose(&KeySpec::default(), &[], None, None), "models:user");
    assert_eq!(keys.compose(&"all".into(), &[], None, None), "models:user:all");
    assert_eq!(
      keys.compose(
        &"group".into(),
        &[json!(4), json!("admin")],
        Some(&SortSpec::by("name").asc()),
        Some("1700000000.000"),
      ),
      "models:user:group:4:admin:name:asc:1700000000.000"
    );
    assert_eq!(keys.object_key(7), "models:user:7");
    assert_eq!(keys.field_key("email", &json!("a@b.c")), "models:user:email:a@b.c");
    assert_eq!(keys.sort_pattern("name"), "models:user:*->name");
  }

  #[test]
  fn test_param_order_matters() {
    let keys = builder();
    let spec = KeySpec::named("pair");
    assert_ne!(
      keys.compose(&spec, &[json!(1), json!(2)], None, None),
      keys.compose(&spec, &[json!(2), json!(1)], None, None)
    );
    assert_eq!(
      keys.compose(&spec, &[json!(1), json!(2)], None, None),
      keys.compose(&spec, &[json!(1), json!(2)], None, None)
    );
  }

  #[test]
  fn test_resolve_sort() {
    let keys = builder();
    assert_eq!(
      keys.resolve_sort(&"alphabetical".into()).unwrap(),
      SortSpec::new("name", SortDirection::Asc)
    );
    assert_eq!(
      keys.resolve_sort(&SortSpec::default().into()).unwrap(),
      SortSpec::new("id", SortDirection::Desc)
    );

    let err = keys.resolve_sort(&"newest".into()).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("Invalid pre-defined sort: newest"));

    assert!(keys.resolve_sort(&SortSpec::by("age").into()).is_err());
  }

  #[test]
  fn test_direction_parse() {
    assert_eq!("DESC".parse::<SortDirection>().unwrap(), SortDirection::Desc);
    assert_eq!("asc".parse::<SortDirection>().unwrap(), SortDirection::Asc);
    assert!("sideways".parse::<SortDirection>().is_err());
  }

  #[tokio::test]
  async fn test_time_bucket_is_stable_until_bumped() {
    let keys = builder();
    let spec = KeySpec::named("recent").with_timer("users");

    let first = keys.build(spec.clone(), vec![]).await.unwrap();
    let again = keys.build(spec.clone(), vec![]).await.unwrap();
    assert_eq!(first, again);
    assert!(first.key.starts_with("models:user:recent:"));

    keys.bump_time("users").await.unwrap();
    let bumped = keys.build(spec, vec![]).await.unwrap();
    assert_ne!(first.key, bumped.key);
  }

  #[tokio::test]
  async fn test_time_bucket_keeps_first_stamp() {
    let keys = builder();
    let cache = keys.cache.clone();
    cache.set("cache:times:race", "1600000000.000", None).await.unwrap();
    assert_eq!(keys.time_bucket("race").await.unwrap(), "1600000000.000");

    let first = keys.time_bucket("fresh").await.unwrap();
    assert_eq!(keys.time_bucket("fresh").await.unwrap(), first);
    assert_eq!(cache.get("cache:times:fresh").await.unwrap(), Some(first));
  }

  #[test]
  fn test_bump_time_strictly_increases() {
    let keys = builder();
    let stamps: Vec<f64> = tokio_test::block_on(async {
      let mut stamps = Vec::new();
      for _ in 0..5 {
        stamps.push(keys.bump_time("burst").await.unwrap().parse().unwrap());
      }
      stamps
    });
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));
  }

  #[tokio::test]
  async fn test_build_carries_ttl_and_fails_unknown_preset() {
    let keys = builder();
    let built = keys
      .build(KeySpec::named("all").with_ttl(Duration::from_secs(30)), vec![])
      .await
      .unwrap();
    assert_eq!(built.key, "models:user:all");
    assert_eq!(built.ttl, Some(Duration::from_secs(30)));

    let err = keys
      .build(KeySpec::named("all").sorted("missing"), vec![])
      .await
      .unwrap_err();
    assert!(err.is_configuration());
  }
}
