#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use cachedmodel::cache::{CacheConfig, InMemoryCacheStore};
use cachedmodel::model::FieldDefinition;
use cachedmodel::{
  CachedModel, DatabaseBackend, EntityDefinition, FieldType, Model, RecordId, Row, SortDirection,
  SqliteBackend,
};

pub const SCHEMA: &str = "
  CREATE TABLE user (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    email TEXT
  );
  CREATE TABLE preload (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER
  );
";

/// Sqlite backend that records every statement it is asked to run.
pub struct CountingBackend {
  inner: SqliteBackend,
  calls: Mutex<Vec<String>>,
  batches: Mutex<Vec<(String, Vec<RecordId>)>>,
}

impl CountingBackend {
  pub async fn new() -> Arc<Self> {
    let inner = SqliteBackend::in_memory().await.unwrap();
    inner.execute_batch(SCHEMA).await.unwrap();
    Arc::new(Self {
      inner,
      calls: Mutex::new(Vec::new()),
      batches: Mutex::new(Vec::new()),
    })
  }

  pub fn calls(&self) -> usize {
    self.calls.lock().len()
  }

  /// Every `find_many` against `table`, with the ids asked for.
  pub fn batches_for(&self, table: &str) -> Vec<Vec<RecordId>> {
    self
      .batches
      .lock()
      .iter()
      .filter(|(t, _)| t == table)
      .map(|(_, ids)| ids.clone())
      .collect()
  }

  pub fn reset(&self) {
    self.calls.lock().clear();
    self.batches.lock().clear();
  }

  fn record(&self, call: String) {
    self.calls.lock().push(call);
  }
}

#[async_trait]
impl DatabaseBackend for CountingBackend {
  async fn execute_batch(&self, sql: &str) -> Result<(), anyhow::Error> {
    self.inner.execute_batch(sql).await
  }

  async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, anyhow::Error> {
    self.record(format!("query {}", sql));
    self.inner.query(sql, params).await
  }

  async fn find_by(
    &self,
    table: &str,
    field: &str,
    value: &Value,
  ) -> Result<Option<Row>, anyhow::Error> {
    self.record(format!("find_by {}.{}", table, field));
    self.inner.find_by(table, field, value).await
  }

  async fn find_many(&self, table: &str, ids: &[RecordId]) -> Result<Vec<Row>, anyhow::Error> {
    self.record(format!("find_many {}", table));
    self.batches.lock().push((table.to_string(), ids.to_vec()));
    self.inner.find_many(table, ids).await
  }

  async fn insert(&self, table: &str, values: &Row) -> Result<RecordId, anyhow::Error> {
    self.record(format!("insert {}", table));
    self.inner.insert(table, values).await
  }

  async fn update(&self, table: &str, id: RecordId, values: &Row) -> Result<u64, anyhow::Error> {
    self.record(format!("update {}", table));
    self.inner.update(table, id, values).await
  }

  async fn delete(&self, table: &str, id: RecordId) -> Result<u64, anyhow::Error> {
    self.record(format!("delete {}", table));
    self.inner.delete(table, id).await
  }
}

pub struct Fixture {
  pub db: Arc<CountingBackend>,
  pub cache: Arc<InMemoryCacheStore>,
  pub users: CachedModel,
  pub preloads: CachedModel,
}

pub fn user_definition() -> Arc<EntityDefinition> {
  EntityDefinition::builder("user")
    .field(FieldDefinition::new("id", FieldType::Id))
    .field(FieldDefinition::new("name", FieldType::String).length(64))
    .field(FieldDefinition::new("email", FieldType::Email).nullable())
    .sort("by_name", "name", SortDirection::Asc)
    .build()
    .unwrap()
}

pub async fn fixture() -> Fixture {
  let db = CountingBackend::new().await;
  let cache = Arc::new(InMemoryCacheStore::new());
  let config = CacheConfig::default();

  let users = CachedModel::new(
    Model::new(user_definition(), db.clone()),
    cache.clone(),
    &config,
  );

  let preload_definition = EntityDefinition::builder("preload")
    .field(FieldDefinition::new("id", FieldType::Id))
    .field(
      FieldDefinition::new("user_id", FieldType::Int)
        .nullable()
        .associate("user", Arc::new(users.clone())),
    )
    .build()
    .unwrap();
  let preloads = CachedModel::new(
    Model::new(preload_definition, db.clone()),
    cache.clone(),
    &config,
  );

  Fixture {
    db,
    cache,
    users,
    preloads,
  }
}

impl Fixture {
  /// Insert users straight into the database, bypassing the cache.
  pub async fn seed_users(&self, names: &[&str]) -> Vec<RecordId> {
    let mut ids = Vec::new();
    for name in names {
      let mut row = Row::new();
      row.insert("name".into(), json!(name));
      row.insert("email".into(), json!(format!("{}@example.com", name)));
      ids.push(self.db.insert("user", &row).await.unwrap());
    }
    self.db.reset();
    ids
  }

  pub async fn seed_preload(&self, user_id: Option<RecordId>) -> RecordId {
    let mut row = Row::new();
    row.insert("user_id".into(), json!(user_id));
    let id = self.db.insert("preload", &row).await.unwrap();
    self.db.reset();
    id
  }
}

/// Let detached cache writes finish.
pub async fn settle() {
  for _ in 0..20 {
    tokio::task::yield_now().await;
  }
}

pub fn names(records: &[cachedmodel::Record]) -> Vec<String> {
  records
    .iter()
    .map(|r| r.get_str("name").unwrap_or_default().to_string())
    .collect()
}
