//! Per-id object cache and secondary field mappings.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::{CachedModel, WriteBack};
use crate::cache::{CacheStore, CacheStoreError};
use crate::db::RecordId;
use crate::error::Result;
use crate::model::{Record, RecordStore};

type HashEntry = (String, Vec<(String, String)>);

impl CachedModel {
  pub(crate) async fn fetch_by_id(&self, id: RecordId) -> Result<Option<Record>> {
    let key = self.keys.object_key(id);
    if let Some(hash) = self.cache.hgetall(&key).await? {
      tracing::debug!(%key, "object cache hit");
      return Ok(Some(Record::from_hash(self.model.definition().clone(), hash)));
    }

    tracing::debug!(%key, "object cache miss");
    let record = self.model.fetch(&Value::from(id), "id").await?;
    if let Some(record) = &record {
      self
        .write_back(vec![(key, record.to_hash())], WriteBack::Detached)
        .await;
    }
    Ok(record)
  }

  pub(crate) async fn fetch_by_field(&self, value: &Value, field: &str) -> Result<Option<Record>> {
    if field == "id" {
      return match id_from_value(value) {
        Some(id) => self.fetch_by_id(id).await,
        None => Ok(None),
      };
    }

    let mapping = self.keys.field_key(field, value);
    if let Some(cached) = self.cache.get(&mapping).await? {
      if let Ok(id) = cached.parse::<RecordId>() {
        if let Some(record) = self.fetch_by_id(id).await? {
          if same_value(record.get(field), value) {
            return Ok(Some(record));
          }
        }
      }
      // the mapping outlived the value it pointed at
      tracing::debug!(key = %mapping, "dropping stale field mapping");
      detach(self.cache.clone(), move |cache| async move {
        cache.delete(&mapping).await.map(|_| ())
      });
      return self.fetch_by_field_uncached(value, field).await;
    }

    self.fetch_by_field_uncached(value, field).await
  }

  async fn fetch_by_field_uncached(&self, value: &Value, field: &str) -> Result<Option<Record>> {
    let mapping = self.keys.field_key(field, value);
    let record = self.model.fetch(value, field).await?;

    match record.as_ref().and_then(|r| r.id().map(|id| (id, r))) {
      Some((id, record)) => {
        let object_key = self.keys.object_key(id);
        let index_key = self.keys.field_index_key(id);
        let hash = record.to_hash();
        detach(self.cache.clone(), move |cache| async move {
          cache.set(&mapping, &id.to_string(), None).await?;
          cache.sadd(&index_key, &[mapping.clone()]).await?;
          cache.hreplace(&object_key, &hash).await
        });
      }
      None => {
        detach(self.cache.clone(), move |cache| async move {
          cache.delete(&mapping).await.map(|_| ())
        });
      }
    }
    Ok(record)
  }

  /// Batched lookup: one multi-get against the cache, one backing-store
  /// query for whatever missed, slots kept in input order.
  pub(crate) async fn load_objects(
    &self,
    ids: &[RecordId],
    mode: WriteBack,
  ) -> Result<Vec<Option<Record>>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    let keys: Vec<String> = ids.iter().map(|id| self.keys.object_key(*id)).collect();
    let hashes = self.cache.hgetall_many(&keys).await?;

    let definition = self.model.definition().clone();
    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    let mut slots: Vec<Option<Record>> = Vec::with_capacity(ids.len());
    for (id, hash) in ids.iter().zip(hashes) {
      match hash {
        Some(hash) => slots.push(Some(Record::from_hash(definition.clone(), hash))),
        None => {
          if seen.insert(*id) {
            missing.push(*id);
          }
          slots.push(None);
        }
      }
    }

    if missing.is_empty() {
      return Ok(slots);
    }

    tracing::debug!(
      table = %definition.table,
      requested = ids.len(),
      missing = missing.len(),
      "batched object lookup"
    );

    let found: HashMap<RecordId, Record> = self
      .model
      .fetch_many(&missing)
      .await?
      .into_iter()
      .flatten()
      .filter_map(|record| record.id().map(|id| (id, record)))
      .collect();

    for (slot, id) in slots.iter_mut().zip(ids) {
      if slot.is_none() {
        *slot = found.get(id).cloned();
      }
    }

    let entries: Vec<HashEntry> = found
      .iter()
      .map(|(id, record)| (self.keys.object_key(*id), record.to_hash()))
      .collect();
    self.write_back(entries, mode).await;

    Ok(slots)
  }

  /// Write object hashes read from the store back into the cache.
  pub(crate) async fn write_back(&self, entries: Vec<HashEntry>, mode: WriteBack) {
    if entries.is_empty() {
      return;
    }
    let cache = self.cache.clone();
    let task = async move {
      if let Err(e) = cache.hreplace_many(&entries).await {
        tracing::warn!(error = %e, count = entries.len(), "failed to write records back to cache");
      }
    };
    match mode {
      WriteBack::Await => task.await,
      WriteBack::Detached => {
        tokio::spawn(task);
      }
    }
  }

  pub(crate) async fn persist_cached(&self, record: Record) -> Result<Record> {
    if !record.is_dirty() {
      return Ok(record);
    }
    let existed = record.id().is_some();
    let saved = self.model.persist(record).await?;
    let Some(id) = saved.id() else {
      return Ok(saved);
    };

    // cache the row as stored, including columns the caller never set
    let key = self.keys.object_key(id);
    let refreshed = match self.model.fetch(&Value::from(id), "id").await {
      Ok(Some(row)) => self.cache.hreplace(&key, &row.to_hash()).await,
      Ok(None) => self.cache.delete(&key).await.map(|_| ()),
      Err(e) => {
        tracing::warn!(error = %e, id, "could not re-read saved record");
        self.cache.delete(&key).await.map(|_| ())
      }
    };
    if let Err(e) = refreshed {
      tracing::warn!(error = %e, %key, "failed to refresh cached record after save");
    }

    if existed {
      self.forget_field_mappings(id).await;
    }
    Ok(saved)
  }

  pub(crate) async fn remove_cached(&self, record: Record) -> Result<()> {
    let id = record.id();
    self.model.remove(record).await?;

    if let Some(id) = id {
      let key = self.keys.object_key(id);
      if let Err(e) = self.cache.delete(&key).await {
        tracing::warn!(error = %e, %key, "failed to drop cached record after delete");
      }
      self.forget_field_mappings(id).await;
    }
    Ok(())
  }

  /// Drop every tracked `(field, value) -> id` mapping for `id`.
  async fn forget_field_mappings(&self, id: RecordId) {
    let index_key = self.keys.field_index_key(id);
    let result: std::result::Result<bool, CacheStoreError> = async {
      for mapping in self.cache.smembers(&index_key).await? {
        self.cache.delete(&mapping).await?;
      }
      self.cache.delete(&index_key).await
    }
    .await;
    if let Err(e) = result {
      tracing::warn!(error = %e, id, "failed to drop field mappings");
    }
  }
}

/// Run a best-effort cache write in the background, logging failures.
fn detach<F, Fut>(cache: Arc<dyn CacheStore>, write: F)
where
  F: FnOnce(Arc<dyn CacheStore>) -> Fut + Send + 'static,
  Fut: Future<Output = std::result::Result<(), CacheStoreError>> + Send + 'static,
{
  tokio::spawn(async move {
    if let Err(e) = write(cache).await {
      tracing::warn!(error = %e, "background cache write failed");
    }
  });
}

fn id_from_value(value: &Value) -> Option<RecordId> {
  match value {
    Value::Number(n) => n.as_i64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

/// Loose equality between a stored value and a lookup value; cached
/// records carry the store's types, lookups may not.
fn same_value(stored: Option<&Value>, wanted: &Value) -> bool {
  let text = |v: &Value| match v {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  };
  match stored {
    Some(stored) => text(stored) == text(wanted),
    None => wanted.is_null(),
  }
}
