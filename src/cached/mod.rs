//! Caching decorator over [`Model`].
//!
//! [`CachedModel`] keeps a key-value cache coherent with the backing store:
//! - per-id object hashes, read-through and refreshed on save
//! - `(field, value) -> id` mappings for secondary lookups
//! - unsorted collection id-sets, populated on first miss
//! - sorted collection id-lists, materialized by the cache's own
//!   sort-by-pattern and rebuilt when membership changes
//!
//! Cache writes that only repopulate what was read from the store are
//! best-effort: failures are logged and never fail the caller.

mod collection;
mod object;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{CacheConfig, CacheStore};
use crate::db::RecordId;
use crate::error::Result;
use crate::key::{CacheKeyBuilder, KeySpec, SortRequest};
use crate::model::{EntityDefinition, Model, Record, RecordStore};
use crate::request::AsyncRequest;

/// Whether a cache repopulation is awaited or left running in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteBack {
  Await,
  Detached,
}

#[derive(Clone)]
pub struct CachedModel {
  model: Model,
  cache: Arc<dyn CacheStore>,
  keys: CacheKeyBuilder,
  default_ttl: Option<Duration>,
}

impl std::fmt::Debug for CachedModel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CachedModel")
      .field("table", &self.model.definition().table)
      .field("prefix", &self.keys.prefix())
      .field("default_ttl", &self.default_ttl)
      .finish()
  }
}

impl CachedModel {
  pub fn new(model: Model, cache: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
    let keys = CacheKeyBuilder::new(model.definition().clone(), &config.key_prefix, cache.clone());
    Self {
      model,
      cache,
      keys,
      default_ttl: config.default_ttl(),
    }
  }

  pub fn model(&self) -> &Model {
    &self.model
  }

  pub fn keys(&self) -> &CacheKeyBuilder {
    &self.keys
  }

  pub fn cache(&self) -> &Arc<dyn CacheStore> {
    &self.cache
  }

  /// A new unsaved record of this entity.
  pub fn create(&self) -> Record {
    self.model.create()
  }

  fn request<T: Send + 'static>(&self) -> AsyncRequest<T> {
    AsyncRequest::for_entity(self.model.definition().clone())
  }

  pub fn load_by_id(&self, id: RecordId) -> AsyncRequest<Option<Record>> {
    let this = self.clone();
    let request = self.request();
    request.complete_with(async move { this.fetch_by_id(id).await });
    request
  }

  pub fn load_by_field(&self, value: impl Into<Value>, field: &str) -> AsyncRequest<Option<Record>> {
    let this = self.clone();
    let value = value.into();
    let field = field.to_string();
    let request = self.request();
    request.complete_with(async move { this.fetch_by_field(&value, &field).await });
    request
  }

  /// Load by any field; `"id"` goes straight to the object cache.
  pub fn load(&self, value: impl Into<Value>, field: &str) -> AsyncRequest<Option<Record>> {
    self.load_by_field(value, field)
  }

  /// Batch load, one result slot per id in input order.
  pub fn load_many(&self, ids: Vec<RecordId>) -> AsyncRequest<Vec<Option<Record>>> {
    let this = self.clone();
    let request = self.request();
    request.complete_with(async move { this.load_objects(&ids, WriteBack::Detached).await });
    request
  }

  /// Persist, refresh the cached copy, then run the definition's save hook.
  pub fn save(&self, record: Record) -> AsyncRequest<Record> {
    let this = self.clone();
    let request = self.model.definition().with_save_hook(self.request());
    request.complete_with(async move { this.persist(record).await });
    request
  }

  /// Delete, drop the cached copy, then run the definition's delete hook.
  pub fn delete(&self, record: Record) -> AsyncRequest<()> {
    let this = self.clone();
    let request = self
      .model
      .definition()
      .with_delete_hook(AsyncRequest::new(), record.id());
    request.complete_with(async move { this.remove(record).await });
    request
  }

  /// Records matched by `sql`, with membership cached under `spec`. A spec
  /// carrying a sort is served as a sorted collection.
  pub fn cached_collection(
    &self,
    sql: &str,
    params: Vec<Value>,
    spec: impl Into<KeySpec>,
  ) -> AsyncRequest<Vec<Record>> {
    let spec = spec.into();
    if let Some(sort) = spec.sort.clone() {
      return self.cached_sorted_collection(sql, params, spec.unsorted(), sort);
    }

    let this = self.clone();
    let sql = sql.to_string();
    let request = self.request();
    request.complete_with(async move { this.collect(&sql, &params, &spec).await });
    request
  }

  /// Records matched by `sql` in the order of `sort`. An unknown preset
  /// fails the request before any I/O.
  pub fn cached_sorted_collection(
    &self,
    sql: &str,
    params: Vec<Value>,
    spec: impl Into<KeySpec>,
    sort: impl Into<SortRequest>,
  ) -> AsyncRequest<Vec<Record>> {
    let sort = match self.keys.resolve_sort(&sort.into()) {
      Ok(sort) => sort,
      Err(err) => {
        return AsyncRequest::failed(err).with_definition(self.model.definition().clone())
      }
    };

    let this = self.clone();
    let sql = sql.to_string();
    let spec = spec.into().unsorted();
    let request = self.request();
    request.complete_with(async move { this.collect_sorted(&sql, &params, &spec, sort).await });
    request
  }

  /// Add `id` to a cached collection and rebuild its materialized sorted views.
  pub fn add_to_collection(
    &self,
    spec: impl Into<KeySpec>,
    params: Vec<Value>,
    id: RecordId,
  ) -> AsyncRequest<()> {
    let this = self.clone();
    let spec = spec.into();
    AsyncRequest::spawn(async move { this.add_member(&spec, &params, id).await })
  }

  /// Remove `id` from a cached collection and rebuild its materialized sorted views.
  pub fn remove_from_collection(
    &self,
    spec: impl Into<KeySpec>,
    params: Vec<Value>,
    id: RecordId,
  ) -> AsyncRequest<()> {
    let this = self.clone();
    let spec = spec.into();
    AsyncRequest::spawn(async move { this.remove_member(&spec, &params, id).await })
  }

  /// Re-stamp a time bucket, retiring every key built with it.
  pub fn bump_time(&self, name: &str) -> AsyncRequest<String> {
    let keys = self.keys.clone();
    let name = name.to_string();
    AsyncRequest::spawn(async move { keys.bump_time(&name).await })
  }
}

#[async_trait]
impl RecordStore for CachedModel {
  fn definition(&self) -> &Arc<EntityDefinition> {
    self.model.definition()
  }

  async fn fetch(&self, value: &Value, field: &str) -> Result<Option<Record>> {
    self.fetch_by_field(value, field).await
  }

  async fn fetch_many(&self, ids: &[RecordId]) -> Result<Vec<Option<Record>>> {
    self.load_objects(ids, WriteBack::Detached).await
  }

  async fn persist(&self, record: Record) -> Result<Record> {
    self.persist_cached(record).await
  }

  async fn remove(&self, record: Record) -> Result<()> {
    self.remove_cached(record).await
  }
}
