//! Cached collections.
//!
//! Unsorted membership is a set of ids under the collection key. A sorted
//! view is a list under the collection key extended with `field:direction`,
//! produced by the cache sorting the membership set by a field read out of
//! every object hash. Views are recorded in `<collection key>:views` so
//! membership changes can rebuild the ones that exist.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CachedModel, WriteBack};
use crate::cache::SortByPattern;
use crate::db::RecordId;
use crate::error::Result;
use crate::key::{KeySpec, SortDirection, SortSpec};
use crate::model::{Record, RecordStore};

/// A materialized sort order over one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SortedView {
  destination: String,
  field: String,
  direction: SortDirection,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  ttl_secs: Option<u64>,
}

fn views_key(collection_key: &str) -> String {
  format!("{}:views", collection_key)
}

fn parse_ids(members: Vec<String>) -> Vec<RecordId> {
  members
    .into_iter()
    .filter_map(|m| match m.parse() {
      Ok(id) => Some(id),
      Err(_) => {
        tracing::warn!(member = %m, "ignoring non-numeric collection member");
        None
      }
    })
    .collect()
}

impl CachedModel {
  pub(crate) async fn collect(&self, sql: &str, params: &[Value], spec: &KeySpec) -> Result<Vec<Record>> {
    let built = self.keys.resolve(spec, params).await?;
    let ttl = built.ttl.or(self.default_ttl);

    let ids = parse_ids(self.cache.smembers(&built.key).await?);
    if !ids.is_empty() {
      tracing::debug!(key = %built.key, members = ids.len(), "collection cache hit");
      return self.present(&ids, WriteBack::Detached).await;
    }

    tracing::debug!(key = %built.key, "collection cache miss");
    let ids = self.populate(sql, params, &built.key, ttl, WriteBack::Detached).await?;
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    self.present(&ids, WriteBack::Detached).await
  }

  pub(crate) async fn collect_sorted(
    &self,
    sql: &str,
    params: &[Value],
    spec: &KeySpec,
    sort: SortSpec,
  ) -> Result<Vec<Record>> {
    let time = self.keys.resolve_time(spec).await?;
    let collection_key = self.keys.compose(spec, params, None, time.as_deref());
    let sorted_key = self.keys.compose(spec, params, Some(&sort), time.as_deref());
    let ttl = spec.ttl.or(self.default_ttl);
    let view = SortedView {
      destination: sorted_key.clone(),
      field: sort.field,
      direction: sort.direction,
      ttl_secs: ttl.map(|t| t.as_secs()),
    };

    // at most two passes: the first may populate membership and
    // materialize the sort, the second reads what was stored
    for pass in 0..2 {
      let ids = parse_ids(self.cache.lrange(&sorted_key).await?);
      if !ids.is_empty() {
        tracing::debug!(key = %sorted_key, members = ids.len(), "sorted collection cache hit");
        return self.present(&ids, WriteBack::Detached).await;
      }

      let mut members = parse_ids(self.cache.smembers(&collection_key).await?);
      if members.is_empty() {
        if pass > 0 {
          break;
        }
        tracing::debug!(key = %collection_key, "sorted collection cold, populating membership");
        members = self.populate(sql, params, &collection_key, ttl, WriteBack::Await).await?;
        if members.is_empty() {
          return Ok(Vec::new());
        }
      }

      // the sort reads every member's object hash
      self.load_objects(&members, WriteBack::Await).await?;
      self.register_view(&collection_key, &view).await?;
      let stored = self.materialize(&collection_key, &view).await?;
      tracing::debug!(key = %sorted_key, stored, "materialized sorted collection");
    }

    Ok(Vec::new())
  }

  pub(crate) async fn add_member(&self, spec: &KeySpec, params: &[Value], id: RecordId) -> Result<()> {
    let built = self.keys.resolve(&spec.unsorted(), params).await?;

    if self.cache.exists(&built.key).await? {
      self.load_objects(&[id], WriteBack::Await).await?;
      self.cache.sadd(&built.key, &[id.to_string()]).await?;
      if let Some(ttl) = built.ttl.or(self.default_ttl) {
        self.cache.expire(&built.key, ttl).await?;
      }
    } else {
      // a cold collection picks the new row up on its next read
      tracing::debug!(key = %built.key, id, "collection not cached, membership left cold");
    }

    self.refresh_views(&built.key).await
  }

  pub(crate) async fn remove_member(
    &self,
    spec: &KeySpec,
    params: &[Value],
    id: RecordId,
  ) -> Result<()> {
    let built = self.keys.resolve(&spec.unsorted(), params).await?;
    self.cache.srem(&built.key, &[id.to_string()]).await?;
    self.refresh_views(&built.key).await
  }

  /// Run the query and cache the resulting ids. An empty result is not cached.
  async fn populate(
    &self,
    sql: &str,
    params: &[Value],
    key: &str,
    ttl: Option<Duration>,
    mode: WriteBack,
  ) -> Result<Vec<RecordId>> {
    let ids = self.model.query_ids(sql, params).await?;
    if ids.is_empty() {
      return Ok(ids);
    }

    let cache = self.cache.clone();
    let key = key.to_string();
    let members: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let task = async move {
      let written = async {
        cache.sadd(&key, &members).await?;
        if let Some(ttl) = ttl {
          cache.expire(&key, ttl).await?;
        }
        Ok::<_, crate::cache::CacheStoreError>(())
      }
      .await;
      if let Err(e) = written {
        tracing::warn!(error = %e, %key, "failed to cache collection membership");
      }
    };
    match mode {
      WriteBack::Await => task.await,
      WriteBack::Detached => {
        tokio::spawn(task);
      }
    }
    Ok(ids)
  }

  /// Resolve ids to records, dropping members whose row no longer exists.
  async fn present(&self, ids: &[RecordId], mode: WriteBack) -> Result<Vec<Record>> {
    let slots = self.load_objects(ids, mode).await?;
    let total = slots.len();
    let records: Vec<Record> = slots.into_iter().flatten().collect();
    if records.len() < total {
      tracing::warn!(
        table = %self.model.definition().table,
        missing = total - records.len(),
        "collection references records that no longer exist"
      );
    }
    Ok(records)
  }

  async fn register_view(&self, collection_key: &str, view: &SortedView) -> Result<()> {
    let member = serde_json::to_string(view)
      .map_err(|e| crate::error::Error::Request(format!("cannot encode sorted view: {}", e)))?;
    self.cache.sadd(&views_key(collection_key), &[member]).await?;
    Ok(())
  }

  async fn materialize(&self, collection_key: &str, view: &SortedView) -> Result<usize> {
    let alpha = self
      .model
      .definition()
      .field(&view.field)
      .map(|f| f.field_type.sorts_alpha())
      .unwrap_or(false);

    let stored = self
      .cache
      .sort_store(&SortByPattern {
        source: collection_key.to_string(),
        by: self.keys.sort_pattern(&view.field),
        alpha,
        descending: view.direction == SortDirection::Desc,
        destination: view.destination.clone(),
      })
      .await?;

    if stored > 0 {
      if let Some(secs) = view.ttl_secs {
        self
          .cache
          .expire(&view.destination, Duration::from_secs(secs))
          .await?;
      }
    }
    Ok(stored)
  }

  /// Re-sort every registered view of a collection that is still cached.
  /// Views that have expired or been evicted are forgotten, not rebuilt.
  /// Member hashes are reloaded once before the first re-sort, since the
  /// sort reads its weights from them.
  async fn refresh_views(&self, collection_key: &str) -> Result<()> {
    let registry = views_key(collection_key);
    let mut warmed = false;
    for raw in self.cache.smembers(&registry).await? {
      let view: SortedView = match serde_json::from_str(&raw) {
        Ok(view) => view,
        Err(e) => {
          tracing::warn!(error = %e, "dropping unreadable sorted view entry");
          self.cache.srem(&registry, &[raw]).await?;
          continue;
        }
      };

      if self.cache.exists(&view.destination).await? {
        if !warmed {
          let members = parse_ids(self.cache.smembers(collection_key).await?);
          self.load_objects(&members, WriteBack::Await).await?;
          warmed = true;
        }
        let stored = self.materialize(collection_key, &view).await?;
        tracing::debug!(key = %view.destination, stored, "rebuilt sorted view");
      } else {
        self.cache.srem(&registry, &[raw]).await?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sorted_view_encoding() {
    let view = SortedView {
      destination: "models:user:all:name:asc".into(),
      field: "name".into(),
      direction: SortDirection::Asc,
      ttl_secs: None,
    };
    let encoded = serde_json::to_string(&view).unwrap();
    assert_eq!(
      encoded,
      r#"{"destination":"models:user:all:name:asc","field":"name","direction":"asc"}"#
    );
    assert_eq!(serde_json::from_str::<SortedView>(&encoded).unwrap(), view);
  }

  #[test]
  fn test_parse_ids_skips_garbage() {
    let ids = parse_ids(vec!["3".into(), "x".into(), "10".into()]);
    assert_eq!(ids, vec![3, 10]);
  }

  #[test]
  fn test_views_key() {
    assert_eq!(views_key("models:user:all"), "models:user:all:views");
  }
}
