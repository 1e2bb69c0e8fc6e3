//! Entity definitions, records, and the plain (uncached) model layer.

mod definition;
mod record;
pub mod validation;

pub use definition::{
  Association, CustomValidator, DeleteHook, EntityDefinition, EntityDefinitionBuilder,
  FieldDefinition, FieldType, SaveHook, SetTransform,
};
pub use record::Record;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::{DatabaseBackend, RecordId};
use crate::error::{Error, Result};
use crate::request::AsyncRequest;

/// The load/save/delete capability shared by the plain model and the
/// caching decorator. Association targets are held through this trait.
#[async_trait]
pub trait RecordStore: Send + Sync {
  fn definition(&self) -> &Arc<EntityDefinition>;

  /// First record whose `field` equals `value`.
  async fn fetch(&self, value: &Value, field: &str) -> Result<Option<Record>>;

  /// One slot per id, in input order; `None` where no row exists.
  async fn fetch_many(&self, ids: &[RecordId]) -> Result<Vec<Option<Record>>>;

  /// Validate and write the dirty fields. Returns the stored record.
  async fn persist(&self, record: Record) -> Result<Record>;

  async fn remove(&self, record: Record) -> Result<()>;
}

/// Plain CRUD over one table.
#[derive(Clone)]
pub struct Model {
  definition: Arc<EntityDefinition>,
  db: Arc<dyn DatabaseBackend>,
}

impl std::fmt::Debug for Model {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Model")
      .field("table", &self.definition.table)
      .finish()
  }
}

impl Model {
  pub fn new(definition: Arc<EntityDefinition>, db: Arc<dyn DatabaseBackend>) -> Self {
    Self { definition, db }
  }

  pub fn db(&self) -> &Arc<dyn DatabaseBackend> {
    &self.db
  }

  /// A new unsaved record of this entity.
  pub fn create(&self) -> Record {
    Record::new(self.definition.clone())
  }

  pub fn load(&self, value: impl Into<Value>, field: &str) -> AsyncRequest<Option<Record>> {
    let this = self.clone();
    let value = value.into();
    let field = field.to_string();
    AsyncRequest::spawn(async move { this.fetch(&value, &field).await })
      .with_definition(self.definition.clone())
  }

  pub fn load_by_id(&self, id: RecordId) -> AsyncRequest<Option<Record>> {
    self.load(id, "id")
  }

  /// Run `sql` and build a record from every row.
  pub fn collection(&self, sql: &str, params: Vec<Value>) -> AsyncRequest<Vec<Record>> {
    let this = self.clone();
    let sql = sql.to_string();
    AsyncRequest::spawn(async move { this.query(&sql, &params).await })
      .with_definition(self.definition.clone())
  }

  /// Batch load by id with one query, result slots in input order.
  pub fn locate(&self, ids: Vec<RecordId>) -> AsyncRequest<Vec<Option<Record>>> {
    let this = self.clone();
    AsyncRequest::spawn(async move { this.fetch_many(&ids).await })
      .with_definition(self.definition.clone())
  }

  /// Persist the dirty fields, then run the definition's save hook.
  pub fn save(&self, record: Record) -> AsyncRequest<Record> {
    let this = self.clone();
    let request = self
      .definition
      .with_save_hook(AsyncRequest::for_entity(self.definition.clone()));
    request.complete_with(async move { this.persist(record).await });
    request
  }

  /// Delete the row, then run the definition's delete hook.
  pub fn delete(&self, record: Record) -> AsyncRequest<()> {
    let this = self.clone();
    let request = self.definition.with_delete_hook(AsyncRequest::new(), record.id());
    request.complete_with(async move { this.remove(record).await });
    request
  }

  pub(crate) async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
    let rows = self.db.query(sql, params).await?;
    Ok(
      rows
        .into_iter()
        .map(|row| Record::from_row(self.definition.clone(), row))
        .collect(),
    )
  }

  /// Ids of the rows `sql` returns, in row order. Rows without an id are skipped.
  pub(crate) async fn query_ids(&self, sql: &str, params: &[Value]) -> Result<Vec<RecordId>> {
    let records = self.query(sql, params).await?;
    Ok(records.iter().filter_map(Record::id).collect())
  }
}

#[async_trait]
impl RecordStore for Model {
  fn definition(&self) -> &Arc<EntityDefinition> {
    &self.definition
  }

  async fn fetch(&self, value: &Value, field: &str) -> Result<Option<Record>> {
    let row = self.db.find_by(&self.definition.table, field, value).await?;
    Ok(row.map(|row| Record::from_row(self.definition.clone(), row)))
  }

  async fn fetch_many(&self, ids: &[RecordId]) -> Result<Vec<Option<Record>>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    // the store returns each row once even when an id repeats
    let rows = self.db.find_many(&self.definition.table, ids).await?;
    let mut by_id: HashMap<RecordId, Record> = rows
      .into_iter()
      .map(|row| Record::from_row(self.definition.clone(), row))
      .filter_map(|record| record.id().map(|id| (id, record)))
      .collect();

    let mut remaining: HashMap<RecordId, usize> = HashMap::with_capacity(ids.len());
    for id in ids {
      *remaining.entry(*id).or_default() += 1;
    }

    let mut slots = Vec::with_capacity(ids.len());
    for id in ids {
      let left = remaining.entry(*id).or_default();
      *left = left.saturating_sub(1);
      let record = if *left > 0 {
        by_id.get(id).cloned()
      } else {
        by_id.remove(id)
      };
      slots.push(record);
    }
    Ok(slots)
  }

  async fn persist(&self, mut record: Record) -> Result<Record> {
    if !record.is_dirty() {
      return Ok(record);
    }

    validation::validate(&self.definition, &record).map_err(Error::Validation)?;

    let mut values = record.dirty_row();
    values.remove("id");
    match record.id() {
      None => {
        let id = self.db.insert(&self.definition.table, &values).await?;
        record.set_id(Some(id));
        tracing::debug!(table = %self.definition.table, id, "inserted record");
      }
      Some(id) => {
        let changed = self.db.update(&self.definition.table, id, &values).await?;
        if changed == 0 && record.dirty_fields().any(|f| f == "id") {
          // explicit id on a new record
          values.insert("id".to_string(), Value::from(id));
          self.db.insert(&self.definition.table, &values).await?;
          tracing::debug!(table = %self.definition.table, id, "inserted record");
        } else {
          tracing::debug!(table = %self.definition.table, id, "updated record");
        }
      }
    }

    record.mark_clean();
    Ok(record)
  }

  async fn remove(&self, record: Record) -> Result<()> {
    let id = record
      .id()
      .ok_or_else(|| Error::Request("cannot delete a record that was never saved".into()))?;
    self.db.delete(&self.definition.table, id).await?;
    tracing::debug!(table = %self.definition.table, id, "deleted record");
    Ok(())
  }
}
